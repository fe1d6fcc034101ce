use std::time::Duration;

use bytes::Bytes;
use chanrpc_frame::{framed_transport, FrameConfig};
use chanrpc_peer::{
    typed_handler, Channel, ChannelServer, Connection, LocalService, Outcome, PathHandler,
    PathRouter, RequestContext, RouteParams, ServerSession, ServiceMultiplexer,
};
use chanrpc_protocol::{RemoteError, Value};
use chanrpc_transport::UnixDomainSocket;
use futures_util::stream;
use tracing::{debug, info, warn};

use crate::cmd::{runtime, ServeArgs};
use crate::exit::{peer_error, transport_error, CliResult, SUCCESS};

/// Service id the demo methods are hosted under.
pub const DEMO_SERVICE: &str = "demo";

const TICK_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_TICKS: i32 = 3;

pub fn run(args: ServeArgs) -> CliResult<i32> {
    runtime()?.block_on(serve(args))
}

async fn serve(args: ServeArgs) -> CliResult<i32> {
    let socket =
        UnixDomainSocket::bind(&args.path).map_err(|err| transport_error("bind failed", err))?;
    let router = PathRouter::new()
        .route(&args.channel, DemoRoute)
        .map_err(|err| peer_error("invalid channel path", err))?;
    let server = ChannelServer::new(router);
    info!(path = ?socket.path(), channel = %args.channel, "serving demo service");

    let mut sessions: Vec<ServerSession> = Vec::new();
    let mut served = 0usize;
    loop {
        let stream = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            accepted = socket.accept() => {
                accepted.map_err(|err| transport_error("accept failed", err))?
            }
        };
        let session = server.accept(framed_transport(stream, FrameConfig::default()));
        debug!(connection_id = session.connection_id(), "connection accepted");
        sessions.retain(|s| !s.is_finished());
        sessions.push(session);

        served += 1;
        if args.count.is_some_and(|count| served >= count) {
            for session in &sessions {
                session.closed().await;
            }
            return Ok(SUCCESS);
        }
    }

    for session in &sessions {
        session.close();
    }
    Ok(SUCCESS)
}

/// Runs a connection hosting the demo service on every routed channel.
struct DemoRoute;

impl PathHandler for DemoRoute {
    fn handle(&self, channel: Channel, connection_id: u64, _params: RouteParams) {
        let transport = match channel.transport() {
            Ok(transport) => transport,
            Err(err) => {
                warn!(channel_id = %channel.id(), error = %err, "channel already in use");
                return;
            }
        };
        let connection = Connection::new(transport);
        ServiceMultiplexer::new(connection.clone()).set(DEMO_SERVICE, demo_service());
        if let Err(err) = connection.listen() {
            warn!(channel_id = %channel.id(), error = %err, "failed to start connection");
            return;
        }
        debug!(connection_id, channel_id = %channel.id(), "demo connection started");
    }

    fn dispose(&self, connection_id: u64) {
        debug!(connection_id, "demo connections released");
    }
}

/// `$echo` returns its first argument, `$add` sums two numbers, `$ticks`
/// streams `n` lines, `$fail` always fails.
pub fn demo_service() -> LocalService {
    LocalService::new()
        .method("$echo", |ctx: RequestContext| async move {
            Ok(Outcome::Value(ctx.args.into_iter().next().unwrap_or_default()))
        })
        .method(
            "$add",
            typed_handler(|(a, b): (f64, f64)| async move { Ok::<_, RemoteError>(a + b) }),
        )
        .method("$ticks", |ctx: RequestContext| async move {
            let count = match ctx.arg(0) {
                Value::Int(n) => *n,
                Value::Undefined | Value::Null => DEFAULT_TICKS,
                other => {
                    return Err(RemoteError::new(format!(
                        "tick count must be a number, got {}",
                        other.kind()
                    )))
                }
            };
            let ticks = stream::unfold(1, move |n| async move {
                if n > count {
                    return None;
                }
                tokio::time::sleep(TICK_INTERVAL).await;
                let line = Bytes::from(format!("tick {n}\n"));
                Some((Ok::<_, RemoteError>(line), n + 1))
            });
            Ok(Outcome::stream(ticks))
        })
        .method("$fail", |_ctx: RequestContext| async move {
            Err(RemoteError::new("demo failure"))
        })
}

#[cfg(test)]
mod tests {
    use chanrpc_peer::Reply;
    use chanrpc_transport::memory_pair;

    use super::*;

    fn demo_pair() -> ServiceMultiplexer {
        let (a, b) = memory_pair();
        let client = Connection::new(a);
        let server = Connection::new(b);
        ServiceMultiplexer::new(server.clone()).set(DEMO_SERVICE, demo_service());
        server.listen().unwrap();
        client.listen().unwrap();
        ServiceMultiplexer::new(client)
    }

    #[tokio::test]
    async fn echo_and_add() {
        let services = demo_pair();
        let proxy = services.get_proxy(DEMO_SERVICE);

        let echo = proxy.get("$echo").unwrap();
        let reply = echo.request(vec![Value::String("hi".into())]).await.unwrap();
        assert!(matches!(reply, Reply::Value(Value::String(s)) if s == "hi"));

        let add = proxy.method::<(i32, i32), i32>("$add");
        assert_eq!(add.call((1, 2)).await.unwrap(), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_stream_lines() {
        let services = demo_pair();
        let ticks = services.get_proxy(DEMO_SERVICE).get("$ticks").unwrap();
        let Reply::Stream(stream) = ticks.request(vec![Value::Int(2)]).await.unwrap() else {
            panic!("expected a stream");
        };
        assert_eq!(stream.collect_bytes().await.unwrap().as_ref(), b"tick 1\ntick 2\n");
    }

    #[tokio::test]
    async fn fail_is_an_error_reply() {
        let services = demo_pair();
        let fail = services.get_proxy(DEMO_SERVICE).get("$fail").unwrap();
        let err = fail.request(vec![]).await.unwrap_err();
        assert!(err.to_string().contains("demo failure"));
    }
}
