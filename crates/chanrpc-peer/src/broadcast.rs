use chanrpc_protocol::Value;
use futures_util::future::join_all;
use tracing::warn;

use crate::connection::Connection;
use crate::error::Result;
use crate::reply::Reply;

/// Send one request to every connection and collapse the replies.
///
/// Replies saying the method is not registered are dropped. If one real
/// result remains it is returned alone; several are returned as an array;
/// none yields [`Reply::MethodNotRegistered`]. The first failed call fails
/// the whole broadcast. Streamed replies are not collected.
pub async fn broadcast_request(
    connections: &[Connection],
    method: &str,
    args: Vec<Value>,
) -> Result<Reply> {
    let calls = connections
        .iter()
        .map(|connection| connection.send_request(method, args.clone()));
    let replies = join_all(calls).await;

    let mut results = Vec::new();
    for reply in replies {
        match reply? {
            Reply::Value(value) => results.push(value),
            Reply::MethodNotRegistered => {}
            Reply::Stream(_) => warn!(method, "ignoring streamed reply in broadcast"),
        }
    }
    Ok(collapse(results))
}

fn collapse(mut results: Vec<Value>) -> Reply {
    match results.len() {
        0 => Reply::MethodNotRegistered,
        1 => Reply::Value(results.remove(0)),
        _ => Reply::Value(Value::Array(results)),
    }
}
