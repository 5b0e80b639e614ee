use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{RpcCall, RpcError, TransportError};

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Deserialize)]
struct WireError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

impl From<WireError> for RpcError {
    fn from(e: WireError) -> Self {
        RpcError::Server {
            code: e.code,
            message: e.message,
            data: e.data,
        }
    }
}

/// Builds the batch body; entry `i` carries id `i`.
pub(crate) fn encode_batch(calls: &[RpcCall]) -> Value {
    Value::Array(
        calls
            .iter()
            .enumerate()
            .map(|(id, call)| {
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "method": call.method(),
                    "params": call.params(),
                })
            })
            .collect(),
    )
}

/// Maps a response body back onto the `batch_len` positions of the request.
///
/// An `Err` applies to the whole batch. Individual `error` entries only fail
/// their own position.
pub(crate) fn match_responses(
    body: Value,
    batch_len: usize,
) -> Result<Vec<Result<Value, RpcError>>, RpcError> {
    let entries = match body {
        Value::Array(entries) => entries,
        entry @ Value::Object(_) => vec![entry],
        other => {
            return Err(TransportError::Malformed(format!(
                "expected an object or array, got {}",
                kind(&other)
            ))
            .into())
        }
    };

    let mut responses = entries
        .into_iter()
        .map(serde_json::from_value::<WireResponse>)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Malformed(e.to_string()))?;

    let mut slots: Vec<Option<Result<Value, RpcError>>> = vec![None; batch_len];

    if batch_len == 1 && responses.len() == 1 {
        // Some nodes echo a different id (or none) for a single request.
        slots[0] = responses.pop().map(into_result);
    } else if responses.len() == 1 && responses[0].id.is_null() && responses[0].error.is_some() {
        // The node rejected the batch as a whole.
        let rejected = responses.pop().and_then(|r| r.error);
        if let Some(error) = rejected {
            return Err(error.into());
        }
    } else {
        for response in responses {
            match response.id.as_u64().map(|id| id as usize) {
                Some(index) if index < batch_len => {
                    if slots[index].is_some() {
                        return Err(RpcError::IdCollision { id: index as u64 });
                    }
                    slots[index] = Some(into_result(response));
                }
                _ => debug!(id = %response.id, batch_len, "ignoring response with unknown id"),
            }
        }
    }

    Ok(slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| slot.unwrap_or(Err(RpcError::MissingResponse { index })))
        .collect())
}

fn into_result(response: WireResponse) -> Result<Value, RpcError> {
    match response.error {
        Some(error) => Err(error.into()),
        None => Ok(response.result.unwrap_or(Value::Null)),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
