//! Many named services over one connection.
//!
//! Method names on the wire are `service_id/method`. Service ids are
//! normalized by replacing `/` with `_`, so two ids that differ only there
//! share one slot; registering the second replaces the first and logs a
//! warning.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chanrpc_protocol::{FromValue, Value};
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::Result;
use crate::handler::{NotificationHandler, Outcome, RequestContext, RequestHandler};
use crate::reply::Reply;
use crate::sync::{lock, read, write};
use crate::typed::{IntoArgs, RemoteMethod};

/// Separator between service id and method name.
pub const SERVICE_SEPARATOR: char = '/';

/// Prefix marking a proxy property as a remote method.
pub const RPC_METHOD_PREFIX: char = '$';

/// Method names starting with this, after the `$`, are notifications when
/// called through [`Invoker::call`].
pub const NOTIFICATION_PREFIX: &str = "on";

/// Map a service id to its wire form.
pub fn normalize_service_id(id: &str) -> String {
    id.replace(SERVICE_SEPARATOR, "_")
}

/// Wire method name of `method` on service `id`.
pub fn service_method(id: &str, method: &str) -> String {
    format!("{}{SERVICE_SEPARATOR}{method}", normalize_service_id(id))
}

/// A locally hosted service: request and notification handlers by method.
#[derive(Default)]
pub struct LocalService {
    requests: HashMap<String, Arc<dyn RequestHandler>>,
    notifications: HashMap<String, NotificationHandler>,
}

impl LocalService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a request handler.
    pub fn method(mut self, name: &str, handler: impl RequestHandler) -> Self {
        self.requests.insert(name.to_string(), Arc::new(handler));
        self
    }

    /// Add a notification handler.
    pub fn notification<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        self.notifications
            .insert(name.to_string(), Arc::new(move |_: &str, args| handler(args)));
        self
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.requests.contains_key(name)
    }

    /// Request method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.requests.keys().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }
}

struct Registered {
    original_id: String,
    service: Arc<LocalService>,
}

type ServiceTable = Arc<RwLock<HashMap<String, Registered>>>;

/// Hosts local services and hands out proxies for remote ones.
///
/// Creating a multiplexer installs catch-all request and notification
/// handlers on the connection.
pub struct ServiceMultiplexer {
    connection: Connection,
    services: ServiceTable,
    proxies: Mutex<HashMap<String, ServiceProxy>>,
}

impl ServiceMultiplexer {
    pub fn new(connection: Connection) -> Self {
        let services: ServiceTable = Arc::default();

        let table = Arc::clone(&services);
        connection.on_request_not_found(move |ctx: RequestContext| {
            let table = Arc::clone(&table);
            async move {
                let Some((service, method)) = split_method(&ctx.method) else {
                    return Ok(Outcome::NotRegistered);
                };
                let handler = read(&table)
                    .get(service)
                    .and_then(|entry| entry.service.requests.get(method).cloned());
                match handler {
                    Some(handler) => handler.call(ctx).await,
                    None => {
                        debug!(method = %ctx.method, "no service method for request");
                        Ok(Outcome::NotRegistered)
                    }
                }
            }
        });

        let table = Arc::clone(&services);
        connection.on_notification_not_found(move |full: &str, args| {
            let Some((service, method)) = split_method(full) else {
                return;
            };
            let handler = read(&table)
                .get(service)
                .and_then(|entry| entry.service.notifications.get(method).cloned());
            match handler {
                Some(handler) => handler(full, args),
                None => debug!(method = full, "no service method for notification"),
            }
        });

        Self {
            connection,
            services,
            proxies: Mutex::new(HashMap::new()),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Host `service` under `id`, replacing whatever was registered under
    /// the same normalized id.
    pub fn set(&self, id: &str, service: LocalService) {
        let key = normalize_service_id(id);
        let mut services = write(&self.services);
        if let Some(previous) = services.get(&key) {
            if previous.original_id != id {
                warn!(
                    service = id,
                    previous = %previous.original_id,
                    normalized = %key,
                    "service ids collide after normalization; replacing"
                );
            }
        }
        debug!(service = id, methods = service.requests.len(), "service registered");
        services.insert(
            key,
            Registered {
                original_id: id.to_string(),
                service: Arc::new(service),
            },
        );
    }

    /// The local service registered under `id`.
    pub fn get(&self, id: &str) -> Option<Arc<LocalService>> {
        read(&self.services)
            .get(&normalize_service_id(id))
            .map(|entry| Arc::clone(&entry.service))
    }

    /// Remove the local service registered under `id`.
    pub fn remove(&self, id: &str) -> bool {
        write(&self.services)
            .remove(&normalize_service_id(id))
            .is_some()
    }

    /// Proxy for the remote service `id`. Proxies are created once and
    /// cached.
    pub fn get_proxy(&self, id: &str) -> ServiceProxy {
        let key = normalize_service_id(id);
        lock(&self.proxies)
            .entry(key.clone())
            .or_insert_with(|| ServiceProxy {
                connection: self.connection.clone(),
                service_id: key,
            })
            .clone()
    }
}

fn split_method(full: &str) -> Option<(&str, &str)> {
    full.split_once(SERVICE_SEPARATOR)
}

/// Calls into one remote service.
#[derive(Clone, Debug)]
pub struct ServiceProxy {
    connection: Connection,
    service_id: String,
}

impl ServiceProxy {
    /// Normalized id of the remote service.
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Invoker for a property name. Only names starting with `$` denote
    /// remote methods; anything else yields `None`.
    ///
    /// [`Invoker::call`] sends `$on...` names as notifications and every
    /// other name as a request.
    pub fn get(&self, name: &str) -> Option<Invoker> {
        if !name.starts_with(RPC_METHOD_PREFIX) {
            return None;
        }
        Some(Invoker {
            connection: self.connection.clone(),
            method: format!("{}{SERVICE_SEPARATOR}{name}", self.service_id),
        })
    }

    /// Typed handle for a remote method of this service.
    pub fn method<A: IntoArgs, R: FromValue>(&self, name: &str) -> RemoteMethod<A, R> {
        self.connection
            .method(&format!("{}{SERVICE_SEPARATOR}{name}", self.service_id))
    }
}

/// A bound remote method.
#[derive(Clone, Debug)]
pub struct Invoker {
    connection: Connection,
    method: String,
}

impl Invoker {
    /// Full wire method name.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Whether [`Invoker::call`] sends this method as a notification.
    pub fn is_notification(&self) -> bool {
        self.method
            .split_once(SERVICE_SEPARATOR)
            .map_or(self.method.as_str(), |(_, name)| name)
            .trim_start_matches(RPC_METHOD_PREFIX)
            .starts_with(NOTIFICATION_PREFIX)
    }

    /// Send by naming rule. A notification resolves to `null` at once.
    pub async fn call(&self, args: Vec<Value>) -> Result<Reply> {
        if self.is_notification() {
            self.notify(args)?;
            return Ok(Reply::Value(Value::Null));
        }
        self.request(args).await
    }

    pub async fn request(&self, args: Vec<Value>) -> Result<Reply> {
        self.connection.send_request(&self.method, args).await
    }

    pub fn notify(&self, args: Vec<Value>) -> Result<()> {
        self.connection.send_notification(&self.method, args)
    }
}
