//! Functions every cluster started by the `tessera-cluster` binary knows.

use std::time::Duration;

use tessera_core::{Blob, Call, FunctionError, FunctionRegistry, TaskInputs, TaskKey};

pub fn registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    registry
        .register_fn1("inc", |x: i64| Ok(x + 1))
        .register_fn2("add", |a: i64, b: i64| Ok(a + b))
        .register("sum", sum)
        .register_fn1("sleep", |ms: u64| {
            std::thread::sleep(Duration::from_millis(ms));
            Ok(ms)
        });
    registry
}

/// Sum of every positional argument, each an `i64`.
fn sum(inputs: &TaskInputs) -> Result<Blob, FunctionError> {
    let mut total = 0i64;
    for index in 0..inputs.args.len() {
        total += inputs.arg::<i64>(index)?;
    }
    Blob::encode(&total).map_err(|e| FunctionError::new("SerializationError", e.to_string()))
}

/// A `sum` call over the results of `keys`.
pub fn sum_of<'a>(keys: impl IntoIterator<Item = &'a TaskKey>) -> Call {
    keys.into_iter()
        .fold(Call::new("sum"), |call, key| call.dep(key.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_adds_every_argument() {
        let registry = registry();
        let f = registry.get("sum").unwrap();
        let inputs = TaskInputs {
            args: [1i64, 2, 3].iter().map(|v| Blob::encode(v).unwrap()).collect(),
            ..TaskInputs::default()
        };
        assert_eq!(f(&inputs).unwrap().decode::<i64>().unwrap(), 6);
    }

    #[test]
    fn sum_rejects_non_integers() {
        let f = registry().get("sum").unwrap();
        let inputs = TaskInputs {
            args: vec![Blob::encode("x").unwrap()],
            ..TaskInputs::default()
        };
        assert_eq!(f(&inputs).unwrap_err().exception, "TypeError");
    }

    #[test]
    fn sum_of_depends_on_every_key() {
        let keys = [TaskKey::from("a"), TaskKey::from("b")];
        let call = sum_of(&keys);
        assert_eq!(call.dependencies().len(), 2);
    }
}
