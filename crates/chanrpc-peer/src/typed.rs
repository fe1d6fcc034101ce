//! Strongly typed call and handler wrappers.

use std::future::Future;
use std::marker::PhantomData;

use chanrpc_protocol::{FromValue, RemoteError, Value};

use crate::connection::Connection;
use crate::error::{PeerError, Result};
use crate::handler::{HandlerFuture, Outcome, RequestContext, RequestHandler};

/// Conversion of a Rust argument tuple into wire arguments.
pub trait IntoArgs {
    fn into_args(self) -> Vec<Value>;
}

/// Conversion of received arguments into a Rust tuple.
///
/// Missing arguments are read as undefined, so `Option` parameters may be
/// omitted by the caller.
pub trait FromArgs: Sized {
    fn from_args(args: Vec<Value>) -> chanrpc_protocol::Result<Self>;
}

impl IntoArgs for () {
    fn into_args(self) -> Vec<Value> {
        Vec::new()
    }
}

impl FromArgs for () {
    fn from_args(_: Vec<Value>) -> chanrpc_protocol::Result<Self> {
        Ok(())
    }
}

impl IntoArgs for Vec<Value> {
    fn into_args(self) -> Vec<Value> {
        self
    }
}

impl FromArgs for Vec<Value> {
    fn from_args(args: Vec<Value>) -> chanrpc_protocol::Result<Self> {
        Ok(args)
    }
}

macro_rules! tuple_args {
    ($($name:ident),+) => {
        impl<$($name: Into<Value>),+> IntoArgs for ($($name,)+) {
            #[allow(non_snake_case)]
            fn into_args(self) -> Vec<Value> {
                let ($($name,)+) = self;
                vec![$($name.into()),+]
            }
        }

        impl<$($name: FromValue),+> FromArgs for ($($name,)+) {
            fn from_args(args: Vec<Value>) -> chanrpc_protocol::Result<Self> {
                let mut args = args.into_iter();
                Ok(($($name::from_value(args.next().unwrap_or_default())?,)+))
            }
        }
    };
}

tuple_args!(A);
tuple_args!(A, B);
tuple_args!(A, B, C);
tuple_args!(A, B, C, D);
tuple_args!(A, B, C, D, E);
tuple_args!(A, B, C, D, E, F);

/// A remote method with Rust argument and result types.
pub struct RemoteMethod<A, R> {
    connection: Connection,
    name: String,
    _types: PhantomData<fn(A) -> R>,
}

impl<A, R> Clone for RemoteMethod<A, R> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            name: self.name.clone(),
            _types: PhantomData,
        }
    }
}

impl<A: IntoArgs, R: FromValue> RemoteMethod<A, R> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Call the method. `Ok(None)` means the remote has no handler for it.
    pub async fn call(&self, args: A) -> Result<Option<R>> {
        let reply = self
            .connection
            .send_request(&self.name, args.into_args())
            .await?;
        match reply.into_value(&self.name)? {
            Some(value) => Ok(Some(R::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Send as a notification, ignoring any result.
    pub fn notify(&self, args: A) -> Result<()> {
        self.connection.send_notification(&self.name, args.into_args())
    }
}

impl Connection {
    /// Typed handle for calling `name` on the remote.
    pub fn method<A, R>(&self, name: &str) -> RemoteMethod<A, R>
    where
        A: IntoArgs,
        R: FromValue,
    {
        RemoteMethod {
            connection: self.clone(),
            name: name.to_string(),
            _types: PhantomData,
        }
    }
}

struct TypedHandler<F, A, R> {
    f: F,
    _types: PhantomData<fn(A) -> R>,
}

impl<F, Fut, A, R> RequestHandler for TypedHandler<F, A, R>
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, RemoteError>> + Send + 'static,
    A: FromArgs + 'static,
    R: Into<Value> + 'static,
{
    fn call(&self, ctx: RequestContext) -> HandlerFuture {
        let args = match A::from_args(ctx.args) {
            Ok(args) => args,
            Err(err) => {
                let error = RemoteError::new(format!("invalid arguments for {}: {err}", ctx.method));
                return Box::pin(async move { Err(error) });
            }
        };
        let fut = (self.f)(args);
        Box::pin(async move { fut.await.map(|result| Outcome::Value(result.into())) })
    }
}

/// Wrap a function over Rust types as a request handler.
///
/// Arguments that do not convert are answered with an error reply.
pub fn typed_handler<F, Fut, A, R>(f: F) -> impl RequestHandler
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, RemoteError>> + Send + 'static,
    A: FromArgs + 'static,
    R: Into<Value> + 'static,
{
    TypedHandler {
        f,
        _types: PhantomData,
    }
}

impl From<PeerError> for RemoteError {
    fn from(err: PeerError) -> Self {
        match err {
            PeerError::Remote(remote) => remote,
            other => RemoteError::new(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use chanrpc_protocol::{ProtocolEntry, ValueType};
    use chanrpc_transport::memory_pair;

    use super::*;

    #[test]
    fn tuples_convert_both_ways() {
        let args = (1i32, "two", true).into_args();
        assert_eq!(
            args,
            vec![Value::Int(1), Value::String("two".into()), Value::Bool(true)]
        );
        let (a, b, c): (i32, String, bool) = FromArgs::from_args(args).unwrap();
        assert_eq!((a, b.as_str(), c), (1, "two", true));

        let (x, y): (i32, Option<String>) = FromArgs::from_args(vec![Value::Int(4)]).unwrap();
        assert_eq!((x, y), (4, None));
    }

    #[tokio::test]
    async fn typed_call_round_trip() {
        let (a, b) = memory_pair();
        let client = Connection::new(a);
        let server = Connection::new(b);
        let entry = ProtocolEntry::new(
            "math/add",
            vec![ValueType::Int32, ValueType::Int32],
            ValueType::Int32,
        );
        client.register_protocol(entry.clone()).unwrap();
        server.register_protocol(entry).unwrap();
        client.listen().unwrap();
        server.listen().unwrap();

        server.on_request(
            "math/add",
            typed_handler(|(a, b): (i32, i32)| async move { Ok::<_, RemoteError>(a + b) }),
        );

        let add = client.method::<(i32, i32), i32>("math/add");
        assert_eq!(add.call((1, 2)).await.unwrap(), Some(3));

        let missing = client.method::<(), i32>("math/sub");
        assert_eq!(missing.call(()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn bad_arguments_become_an_error_reply() {
        let (a, b) = memory_pair();
        let client = Connection::new(a);
        let server = Connection::new(b);
        client.listen().unwrap();
        server.listen().unwrap();
        server.on_request(
            "len",
            typed_handler(|(s,): (String,)| async move { Ok::<_, RemoteError>(s.len() as i32) }),
        );

        let len = client.method::<(i32,), i32>("len");
        match len.call((5,)).await {
            Err(PeerError::Remote(err)) => assert!(err.message().contains("invalid arguments")),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
