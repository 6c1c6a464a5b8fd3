pub mod admin;
pub mod conversations;

use serde_json::{json, Value};

/// `{ "success": true, "data": ... }`
pub(crate) fn success(data: Value) -> Value {
    json!({ "success": true, "data": data })
}

/// Ids arrive as decimal strings, though plain JSON numbers are tolerated.
pub(crate) fn parse_id_value(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::String(raw) => livechat_util::snowflake::parse(raw),
        Value::Number(raw) => raw.as_i64().filter(|id| *id > 0),
        _ => None,
    }
}
