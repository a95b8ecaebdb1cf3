#![no_main]

use cancellable_sql::pg::params::bind;
use cancellable_sql::Value;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|input: (String, Vec<Option<i64>>)| {
    let (sql, ints) = input;
    let params: Vec<Value> = ints
        .into_iter()
        .map(|v| v.map_or(Value::Null, Value::Int))
        .collect();
    if let Ok(bound) = bind(&sql, &params) {
        assert!(!bound.contains('\0') || sql.contains('\0'));
    }
});
