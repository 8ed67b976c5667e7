//! Single fan-in task that routes requests to services by message name.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::chat::error::ChatError;
use crate::chat::service::{Service, ServiceRequest};

/// What happened to one dispatched request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    /// No service is registered under the name. The request was dropped.
    UnknownService(String),
    /// The service returned an error or panicked. The request was dropped.
    HandlerFailed(String),
}

/// Closed registry of services, populated before [`Dispatcher::spawn`].
#[derive(Default)]
pub struct Dispatcher {
    services: HashMap<String, Box<dyn Service>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("services", &self.service_names())
            .finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `service` under `name`.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        service: Box<dyn Service>,
    ) -> Result<(), ChatError> {
        let name = name.into();
        if self.services.contains_key(&name) {
            return Err(ChatError::DuplicateServiceName(name));
        }
        tracing::debug!(service = %name, "Registered service");
        self.services.insert(name, service);
        Ok(())
    }

    /// Registered names, sorted.
    pub fn service_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.services.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Hands one request to its service.
    pub async fn dispatch(&mut self, request: ServiceRequest) -> DispatchOutcome {
        let name = request.message_name.clone();
        let origin = request.origin;

        let Some(service) = self.services.get_mut(&name) else {
            tracing::warn!(connection = %origin, message_name = %name, "No service registered, dropping");
            return DispatchOutcome::UnknownService(name);
        };

        match AssertUnwindSafe(service.handle(request)).catch_unwind().await {
            Ok(Ok(())) => DispatchOutcome::Handled,
            Ok(Err(e)) => {
                tracing::error!(
                    connection = %origin,
                    message_name = %name,
                    error = %e,
                    "Service handler failed"
                );
                DispatchOutcome::HandlerFailed(e.to_string())
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                tracing::error!(
                    connection = %origin,
                    message_name = %name,
                    panic = %reason,
                    "Service handler panicked"
                );
                DispatchOutcome::HandlerFailed(format!("panicked: {}", reason))
            }
        }
    }

    /// Moves the registry into its own task.
    ///
    /// The task runs until every [`DispatcherHandle`] is dropped. A zero
    /// capacity is raised to one.
    pub fn spawn(self, capacity: usize) -> (DispatcherHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(self.run(rx));
        (DispatcherHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<ServiceRequest>) {
        tracing::info!(services = ?self.service_names(), "Dispatcher started");
        while let Some(request) = rx.recv().await {
            self.dispatch(request).await;
        }
        tracing::info!("Dispatcher stopped");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Cloneable submission side of a running dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<ServiceRequest>,
}

impl DispatcherHandle {
    /// Queues a request, waiting while the dispatcher is busy.
    pub async fn submit(&self, request: ServiceRequest) -> Result<(), ChatError> {
        self.tx
            .send(request)
            .await
            .map_err(|_| ChatError::DispatcherStopped)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::chat::service::test_support::{request, responder};
    use crate::chat::service::ServiceError;

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl Service for Counting {
        async fn handle(&mut self, request: ServiceRequest) -> Result<(), ServiceError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            request.responder.reply("Count", request.payload).await
        }
    }

    struct Failing;

    #[async_trait]
    impl Service for Failing {
        async fn handle(&mut self, _request: ServiceRequest) -> Result<(), ServiceError> {
            Err(ServiceError::Failed("boom".to_string()))
        }
    }

    struct Panicking;

    #[async_trait]
    impl Service for Panicking {
        async fn handle(&mut self, request: ServiceRequest) -> Result<(), ServiceError> {
            let empty: Vec<u8> = Vec::new();
            let index = request.payload.len();
            request.responder.reply("Never", vec![empty[index]]).await
        }
    }

    #[test]
    fn test_duplicate_register() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register("Count", Box::new(Failing)).unwrap();
        assert!(matches!(
            dispatcher.register("Count", Box::new(Failing)),
            Err(ChatError::DuplicateServiceName(name)) if name == "Count"
        ));
        assert_eq!(dispatcher.service_names(), vec!["Count"]);
    }

    #[tokio::test]
    async fn test_unknown_service_dropped() {
        let mut dispatcher = Dispatcher::new();
        let (alice, mut rx) = responder(4);
        let outcome = dispatcher.dispatch(request(&alice, "Nobody", vec![], "alice")).await;
        assert_eq!(outcome, DispatchOutcome::UnknownService("Nobody".to_string()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handler_failure_reported() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register("Fail", Box::new(Failing)).unwrap();
        let (alice, _rx) = responder(4);
        let outcome = dispatcher.dispatch(request(&alice, "Fail", vec![], "alice")).await;
        assert!(matches!(outcome, DispatchOutcome::HandlerFailed(_)));
    }

    #[tokio::test]
    async fn test_spawned_loop_survives_failures() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = Dispatcher::new();
        dispatcher.register("Count", Box::new(Counting(count.clone()))).unwrap();
        dispatcher.register("Fail", Box::new(Failing)).unwrap();

        let (handle, task) = dispatcher.spawn(0);
        let (alice, mut rx) = responder(4);

        handle.submit(request(&alice, "Fail", vec![], "alice")).await.unwrap();
        handle.submit(request(&alice, "Nobody", vec![], "alice")).await.unwrap();
        handle.submit(request(&alice, "Count", vec![7], "alice")).await.unwrap();

        assert!(rx.recv().await.is_some());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_panic_reported() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register("Bad", Box::new(Panicking)).unwrap();
        let (alice, _rx) = responder(4);
        let outcome = dispatcher.dispatch(request(&alice, "Bad", vec![], "alice")).await;
        assert!(matches!(outcome, DispatchOutcome::HandlerFailed(reason) if reason.starts_with("panicked")));
    }

    #[tokio::test]
    async fn test_spawned_loop_survives_panic() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = Dispatcher::new();
        dispatcher.register("Bad", Box::new(Panicking)).unwrap();
        dispatcher.register("Count", Box::new(Counting(count.clone()))).unwrap();

        let (handle, task) = dispatcher.spawn(1);
        let (alice, mut rx) = responder(4);
        let (bob, mut bob_rx) = responder(4);

        handle.submit(request(&alice, "Bad", vec![], "alice")).await.unwrap();
        handle.submit(request(&bob, "Count", vec![1], "bob")).await.unwrap();
        handle.submit(request(&alice, "Bad", vec![2], "alice")).await.unwrap();
        handle.submit(request(&bob, "Count", vec![3], "bob")).await.unwrap();

        assert!(bob_rx.recv().await.is_some());
        assert!(bob_rx.recv().await.is_some());
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(rx.try_recv().is_err());

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_after_stop() {
        let (handle, task) = Dispatcher::new().spawn(1);
        task.abort();
        let _ = task.await;

        let (alice, _rx) = responder(4);
        assert!(matches!(
            handle.submit(request(&alice, "Count", vec![], "alice")).await,
            Err(ChatError::DispatcherStopped)
        ));
    }
}
