//! The `Rpc` entrypoint (§4.5): validates an inbound request against the
//! declared method signature, unpacks context headers, spawns a worker, and
//! wires the worker's outcome to a reply publish via
//! `handle_result = Responder::send_response`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use serde_json::Value;

use crate::container::{ContainerHandle, HandleResult, MethodHandler, ServiceDescriptor, WorkerContext, WorkerOutcome};
use crate::errors::exception::{IncorrectSignature, MalformedRequest};
use crate::errors::{serialize, ConfigurationError, ContainerBeingKilled};
use crate::extensions::{Entrypoint, Extension};
use crate::messaging::{DefaultHeaderCodec, HeaderCodec};

use super::consumer::{request_headers, RpcConsumer, RpcProvider};
use super::{request_queue_name, RequestBody};

/// Binds one service method as an RPC-callable entrypoint. Generic over the
/// owning [`ServiceDescriptor`] so it can build a fresh service instance and
/// invoke the bound [`MethodHandler`] (§4.3, §4.5).
pub struct Rpc<S: ServiceDescriptor> {
    self_weak: Weak<Rpc<S>>,
    method_name: &'static str,
    param_names: &'static [&'static str],
    expected_exceptions: &'static [&'static str],
    sensitive_arguments: &'static [&'static str],
    container: ContainerHandle<S>,
    handler: MethodHandler<S>,
    rpc_consumer: tokio::sync::OnceCell<Arc<RpcConsumer>>,
    header_codec: Arc<dyn HeaderCodec>,
}

impl<S: ServiceDescriptor> Rpc<S> {
    /// Builds a bound `Rpc` entrypoint. `param_names` lists the target
    /// method's declared parameter names in positional order and drives
    /// [`Rpc::check_signature`] (§4.5, §7 — `IncorrectSignature`).
    #[allow(clippy::too_many_arguments)]
    pub fn bind(
        container: ContainerHandle<S>,
        handler: MethodHandler<S>,
        method_name: &'static str,
        param_names: &'static [&'static str],
        expected_exceptions: &'static [&'static str],
        sensitive_arguments: &'static [&'static str],
    ) -> Arc<dyn Entrypoint> {
        let concrete: Arc<Rpc<S>> = Arc::new_cyclic(|weak| Self {
            self_weak: weak.clone(),
            method_name,
            param_names,
            expected_exceptions,
            sensitive_arguments,
            container,
            handler,
            rpc_consumer: tokio::sync::OnceCell::new(),
            header_codec: Arc::new(DefaultHeaderCodec::default()),
        });
        concrete
    }

    /// Mirrors `inspect.Signature.bind(*args, **kwargs)`: every positional
    /// arg must line up with a declared parameter not also supplied by
    /// keyword, every keyword must name a declared parameter, and every
    /// declared parameter must end up covered exactly once.
    fn check_signature(&self, args: &[Value], kwargs: &HashMap<String, Value>) -> Result<(), IncorrectSignature> {
        if args.len() > self.param_names.len() {
            return Err(IncorrectSignature(format!(
                "{}() takes {} positional argument(s) but {} were given",
                self.method_name,
                self.param_names.len(),
                args.len()
            )));
        }

        let positional: HashSet<&str> = self.param_names[..args.len()].iter().copied().collect();
        for key in kwargs.keys() {
            if positional.contains(key.as_str()) {
                return Err(IncorrectSignature(format!("{}() got multiple values for argument '{key}'", self.method_name)));
            }
            if !self.param_names.contains(&key.as_str()) {
                return Err(IncorrectSignature(format!("{}() got an unexpected keyword argument '{key}'", self.method_name)));
            }
        }

        let covered: HashSet<&str> = positional.into_iter().chain(kwargs.keys().map(String::as_str)).collect();
        let missing: Vec<&str> = self.param_names.iter().copied().filter(|p| !covered.contains(p)).collect();
        if !missing.is_empty() {
            return Err(IncorrectSignature(format!(
                "{}() missing required argument(s): {}",
                self.method_name,
                missing.join(", ")
            )));
        }
        Ok(())
    }

    async fn reply_error_and_ack(&self, delivery: &lapin::message::Delivery, error: crate::errors::SerializedException) {
        let reply_to = delivery.properties.reply_to().as_ref().map(|s| s.as_str().to_string());
        let correlation_id = delivery.properties.correlation_id().as_ref().map(|s| s.as_str().to_string());
        if let (Some(reply_to), Some(correlation_id)) = (reply_to, correlation_id) {
            if let Some(rpc_consumer) = self.rpc_consumer.get() {
                let body = super::ReplyBody { result: None, error: Some(error) };
                if let Err(e) = rpc_consumer.responder().publish_reply(&reply_to, &correlation_id, &body).await {
                    tracing::error!(error = %e, "failed to publish rpc error reply");
                }
            }
        }
        let _ = delivery.ack(BasicAckOptions::default()).await;
    }
}

#[async_trait]
impl<S: ServiceDescriptor> Extension for Rpc<S> {
    async fn setup(&self) -> Result<(), ConfigurationError> {
        let container = self.container.upgrade().expect("container alive during setup");
        let rpc_consumer = super::consumer::get_or_init_rpc_consumer(&container);
        let provider = self.self_weak.upgrade().expect("alive during setup") as Arc<dyn RpcProvider>;
        rpc_consumer.register_provider(self.method_name, provider).await;
        // `OnceCell::set` can only race with itself here, and `setup` runs
        // exactly once per entrypoint, so a second caller never happens.
        let _ = self.rpc_consumer.set(rpc_consumer);
        Ok(())
    }

    async fn stop(&self) {
        if let Some(rpc_consumer) = self.rpc_consumer.get() {
            rpc_consumer.unregister_provider(self.method_name).await;
        }
    }

    async fn kill(&self) {
        if let Some(rpc_consumer) = self.rpc_consumer.get() {
            rpc_consumer.unregister_provider(self.method_name).await;
        }
    }
}

impl<S: ServiceDescriptor> Entrypoint for Rpc<S> {
    fn method_name(&self) -> &str {
        self.method_name
    }

    fn expected_exceptions(&self) -> &[&'static str] {
        self.expected_exceptions
    }

    fn sensitive_arguments(&self) -> &[&'static str] {
        self.sensitive_arguments
    }
}

#[async_trait]
impl<S: ServiceDescriptor> RpcProvider for Rpc<S> {
    async fn handle_delivery(&self, delivery: lapin::message::Delivery) {
        let Some(container) = self.container.upgrade() else { return };

        let request: RequestBody = match serde_json::from_slice(&delivery.data) {
            Ok(body) => body,
            Err(_) => {
                self.reply_error_and_ack(&delivery, serialize(&MalformedRequest)).await;
                return;
            }
        };

        if let Err(err) = self.check_signature(&request.args, &request.kwargs) {
            self.reply_error_and_ack(&delivery, serialize(&err)).await;
            return;
        }

        let headers = request_headers(&delivery);
        let call_id_stack = crate::messaging::decode_call_id_stack(self.header_codec.as_ref(), &headers);
        let mut context_data = self.header_codec.decode(&headers);
        // the call-id stack travels under its own header and is not part of
        // the ordinary context-data map (§3, mirroring `containers.py`'s
        // `data.pop(CALL_ID_STACK_CONTEXT_KEY, [])`).
        context_data.remove("call_id_stack");

        let ctx = WorkerContext::new(
            S::NAME,
            self.method_name,
            request.args,
            request.kwargs,
            context_data,
            &call_id_stack,
            container.parent_calls_tracked(),
        );

        let rpc_consumer = self.rpc_consumer.get().expect("setup runs before any delivery can arrive").clone();
        let delivery_holder = Arc::new(Mutex::new(Some(delivery)));
        let handle_result: HandleResult = {
            let delivery_holder = delivery_holder.clone();
            Arc::new(move |_ctx: WorkerContext, outcome: WorkerOutcome| {
                let rpc_consumer = rpc_consumer.clone();
                let delivery_holder = delivery_holder.clone();
                Box::pin(async move {
                    let delivery = delivery_holder.lock().expect("delivery mutex poisoned").take();
                    if let Some(delivery) = delivery {
                        let reply_to = delivery.properties.reply_to().as_ref().map(|s| s.as_str().to_string());
                        let correlation_id = delivery.properties.correlation_id().as_ref().map(|s| s.as_str().to_string());
                        if let (Some(reply_to), Some(correlation_id)) = (reply_to, correlation_id) {
                            if let Err(e) = rpc_consumer.responder().send_response(&reply_to, &correlation_id, &outcome).await {
                                tracing::error!(error = %e, "failed to publish rpc reply");
                            }
                        }
                        let _ = delivery.ack(BasicAckOptions::default()).await;
                    }
                    outcome
                }) as futures::future::BoxFuture<'static, WorkerOutcome>
            })
        };

        let entrypoint = self.self_weak.upgrade().expect("alive during dispatch") as Arc<dyn Entrypoint>;
        if let Err(ContainerBeingKilled) = container.spawn_worker(entrypoint, self.handler.clone(), ctx, Some(handle_result)) {
            if let Some(delivery) = delivery_holder.lock().expect("delivery mutex poisoned").take() {
                let _ = delivery.nack(BasicNackOptions { requeue: true, ..Default::default() }).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(v: &[&'static str]) -> &'static [&'static str] {
        Box::leak(v.to_vec().into_boxed_slice())
    }

    struct Dummy;
    impl ServiceDescriptor for Dummy {
        const NAME: &'static str = "dummy";
        fn new_instance() -> Self {
            Dummy
        }
        fn dependencies() -> Vec<crate::container::DependencyBinding<Self>> {
            vec![]
        }
        fn entrypoints() -> Vec<crate::container::EntrypointBinding<Self>> {
            vec![]
        }
    }

    fn make_rpc(param_names: &'static [&'static str]) -> Arc<Rpc<Dummy>> {
        let container = crate::container::ServiceContainer::<Dummy>::new(crate::config::Config::default()).unwrap();
        let handle = container.handle();
        let handler: MethodHandler<Dummy> = Arc::new(|_s, _a, _k, _d| Box::pin(async { Ok(Value::Null) }));
        Arc::new_cyclic(|weak| Rpc {
            self_weak: weak.clone(),
            method_name: "add",
            param_names,
            expected_exceptions: &[],
            sensitive_arguments: &[],
            container: handle,
            handler,
            rpc_consumer: tokio::sync::OnceCell::new(),
            header_codec: Arc::new(DefaultHeaderCodec::default()),
        })
    }

    #[test]
    fn signature_check_accepts_exact_positional_match() {
        let rpc = make_rpc(names(&["a", "b"]));
        let args = vec![Value::from(1), Value::from(2)];
        assert!(rpc.check_signature(&args, &HashMap::new()).is_ok());
    }

    #[test]
    fn signature_check_rejects_too_many_positional_args() {
        let rpc = make_rpc(names(&["a"]));
        let args = vec![Value::from(1), Value::from(2)];
        assert!(rpc.check_signature(&args, &HashMap::new()).is_err());
    }

    #[test]
    fn signature_check_rejects_unknown_keyword() {
        let rpc = make_rpc(names(&["a"]));
        let mut kwargs = HashMap::new();
        kwargs.insert("z".to_string(), Value::from(1));
        assert!(rpc.check_signature(&[], &kwargs).is_err());
    }

    #[test]
    fn signature_check_rejects_missing_argument() {
        let rpc = make_rpc(names(&["a", "b"]));
        let args = vec![Value::from(1)];
        assert!(rpc.check_signature(&args, &HashMap::new()).is_err());
    }

    #[test]
    fn signature_check_rejects_duplicate_argument() {
        let rpc = make_rpc(names(&["a"]));
        let args = vec![Value::from(1)];
        let mut kwargs = HashMap::new();
        kwargs.insert("a".to_string(), Value::from(2));
        assert!(rpc.check_signature(&args, &kwargs).is_err());
    }
}
