//! The `Service` contract implemented by every hosted service.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use svhost_protocol::{HostResult, ServiceConfig};
use svhost_transport::Connection;

use crate::unit::ServiceHandle;

/// Trait implemented by all hosted services.
///
/// The runtime owns the generic behaviour (running flag, listener,
/// connection set, counters, children); implementations supply the hooks.
/// Every hook receives the handle of the service it runs under.
pub trait Service: Send + Sync + 'static {
    /// Whether a started SERVER-type instance binds a listener.
    fn accepts_sockets(&self) -> bool {
        true
    }

    /// Setup run after the listener is bound. May spawn internal connections.
    /// An error shuts the service straight back down.
    fn start(&self, _svc: &ServiceHandle) -> impl Future<Output = HostResult<()>> + Send {
        async { Ok(()) }
    }

    /// Teardown run after the listener is closed, before connections are closed.
    fn shutdown(&self, _svc: &ServiceHandle) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Per-connection logic. Runs in its own task until it returns, the peer
    /// goes away, or the service stops.
    fn serve(
        &self,
        svc: &ServiceHandle,
        conn: Connection,
    ) -> impl Future<Output = HostResult<()>> + Send;

    /// Self-check used by watchdogs while the service is running.
    fn validate(&self, _svc: &ServiceHandle) -> impl Future<Output = HostResult<()>> + Send {
        async { Ok(()) }
    }
}

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe wrapper for the Service trait.
pub(crate) trait ServiceDyn: Send + Sync {
    fn accepts_sockets_dyn(&self) -> bool;
    fn start_dyn<'a>(&'a self, svc: &'a ServiceHandle) -> BoxFuture<'a, HostResult<()>>;
    fn shutdown_dyn<'a>(&'a self, svc: &'a ServiceHandle) -> BoxFuture<'a, ()>;
    fn serve_dyn<'a>(
        &'a self,
        svc: &'a ServiceHandle,
        conn: Connection,
    ) -> BoxFuture<'a, HostResult<()>>;
    fn validate_dyn<'a>(&'a self, svc: &'a ServiceHandle) -> BoxFuture<'a, HostResult<()>>;
}

impl<T: Service> ServiceDyn for T {
    fn accepts_sockets_dyn(&self) -> bool {
        self.accepts_sockets()
    }
    fn start_dyn<'a>(&'a self, svc: &'a ServiceHandle) -> BoxFuture<'a, HostResult<()>> {
        Box::pin(self.start(svc))
    }
    fn shutdown_dyn<'a>(&'a self, svc: &'a ServiceHandle) -> BoxFuture<'a, ()> {
        Box::pin(self.shutdown(svc))
    }
    fn serve_dyn<'a>(
        &'a self,
        svc: &'a ServiceHandle,
        conn: Connection,
    ) -> BoxFuture<'a, HostResult<()>> {
        Box::pin(self.serve(svc, conn))
    }
    fn validate_dyn<'a>(&'a self, svc: &'a ServiceHandle) -> BoxFuture<'a, HostResult<()>> {
        Box::pin(self.validate(svc))
    }
}

/// Constructor registered under an implementation identifier.
pub(crate) type Factory =
    Arc<dyn Fn(&ServiceConfig) -> HostResult<Arc<dyn ServiceDyn>> + Send + Sync>;
