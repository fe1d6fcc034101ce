use std::time::{Duration, Instant};

use chanrpc_frame::{framed_transport, FrameConfig};
use chanrpc_peer::{ChannelClient, ChannelClientConfig, Connection, ConnectionOptions, Reply};
use chanrpc_protocol::Value;
use chanrpc_transport::UnixDomainSocket;
use tracing::debug;

use crate::cmd::{parse_duration, runtime, CallArgs};
use crate::exit::{peer_error, transport_error, CliError, CliResult, SUCCESS, TIMEOUT};
use crate::output::{print_call, CallResult, OutputFormat};

pub fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let call_args = parse_args(&args.args)?;

    let started = Instant::now();
    let result = runtime()?.block_on(async {
        tokio::time::timeout(timeout, call(&args, call_args, timeout))
            .await
            .map_err(|_| {
                CliError::new(
                    TIMEOUT,
                    format!("call {} timed out after {timeout:?}", args.method),
                )
            })?
    })?;

    print_call(
        &args.method,
        &args.channel,
        &result,
        started.elapsed().as_millis(),
        format,
    );
    Ok(SUCCESS)
}

async fn call(args: &CallArgs, call_args: Vec<Value>, timeout: Duration) -> CliResult<CallResult> {
    let stream = UnixDomainSocket::connect(&args.path)
        .await
        .map_err(|err| transport_error("connect failed", err))?;
    let config = ChannelClientConfig::default().with_open_timeout(timeout);
    let client = ChannelClient::new(framed_transport(stream, FrameConfig::default()), config);

    let channel = client
        .open_channel(&args.channel)
        .await
        .map_err(|err| peer_error("open failed", err))?;
    debug!(channel_id = %channel.id(), "channel ready");

    let transport = channel
        .transport()
        .map_err(|err| peer_error("open failed", err))?;
    let connection =
        Connection::with_options(transport, ConnectionOptions::default().with_timeout(timeout));
    connection
        .listen()
        .map_err(|err| peer_error("listen failed", err))?;

    let reply = connection
        .send_request(&args.method, call_args)
        .await
        .map_err(|err| peer_error("call failed", err))?;
    let result = match reply {
        Reply::Value(value) => CallResult::Value(value),
        Reply::MethodNotRegistered => CallResult::NotRegistered,
        Reply::Stream(stream) => CallResult::Streamed(
            stream
                .collect_bytes()
                .await
                .map_err(|err| peer_error("stream failed", err))?,
        ),
    };

    connection.close();
    client.close();
    Ok(result)
}

/// Each `--arg` is one JSON document.
fn parse_args(raw: &[String]) -> CliResult<Vec<Value>> {
    raw.iter()
        .map(|arg| {
            serde_json::from_str(arg)
                .map(Value::from_json)
                .map_err(|err| CliError::usage(format!("invalid --arg {arg:?}: {err}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::USAGE;

    #[test]
    fn args_are_json_documents() {
        let args = parse_args(&["1".into(), "\"two\"".into(), "[true]".into()]).unwrap();
        assert_eq!(
            args,
            vec![
                Value::Int(1),
                Value::String("two".into()),
                Value::Array(vec![Value::Bool(true)]),
            ]
        );
    }

    #[test]
    fn bare_words_are_a_usage_error() {
        let err = parse_args(&["hello".into()]).unwrap_err();
        assert_eq!(err.code, USAGE);
    }
}
