//! Saga lookup, execution and persistence.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, error, warn};

use super::{
    ProcessInstance, ProcessManager, ProcessManagerData, ProcessManagerHandler,
    ProcessManagerPropertyMapper, StartProcessManager,
};
use crate::handlers::{ConsumeContext, HandlerError};
use crate::message::{codec, Message, MessageKind, MessageTypeInfo};
use crate::storage::{PersistanceData, ProcessManagerFinder, ProcessManagerFinderExt};

/// Everything a saga entry needs besides the message body.
#[derive(Clone)]
struct SagaScope {
    context: ConsumeContext,
    finder: Arc<dyn ProcessManagerFinder>,
    timeout_destination: Arc<str>,
}

impl SagaScope {
    fn instance<D: ProcessManagerData>(&self, data: D) -> ProcessInstance<D> {
        ProcessInstance::new(
            data,
            self.context.clone(),
            self.finder.clone(),
            self.timeout_destination.clone(),
        )
    }
}

type InvokeFuture = BoxFuture<'static, Result<(), HandlerError>>;

type SagaInvokeFn = Arc<dyn Fn(&[u8], SagaScope) -> InvokeFuture + Send + Sync>;

struct SagaEntry {
    saga_type: &'static str,
    invoke: SagaInvokeFn,
}

fn build_mapper<P: ProcessManager>() -> Arc<ProcessManagerPropertyMapper<P::Data>> {
    let mut mapper = ProcessManagerPropertyMapper::new();
    P::configure_mapper(&mut mapper);
    Arc::new(mapper)
}

/// Dispatches messages to saga start and continuation handlers.
///
/// For each inbound message two phases run concurrently. The start phase
/// loads matching data or creates it fresh, executes, then inserts (fresh)
/// or updates (existing); that choice is fixed at lookup. The continuation
/// phase skips sagas with no matching data, executes, then deletes the
/// data if the saga completed or updates it otherwise.
pub struct ProcessManagerProcessor {
    starts: HashMap<String, Vec<SagaEntry>>,
    continuations: HashMap<String, Vec<SagaEntry>>,
    finder: Arc<dyn ProcessManagerFinder>,
    timeout_destination: Arc<str>,
}

impl ProcessManagerProcessor {
    pub fn new(finder: Arc<dyn ProcessManagerFinder>, timeout_destination: &str) -> Self {
        Self {
            starts: HashMap::new(),
            continuations: HashMap::new(),
            finder,
            timeout_destination: Arc::from(timeout_destination),
        }
    }

    /// Replace the store and timeout destination used by every saga.
    pub fn bind_store(&mut self, finder: Arc<dyn ProcessManagerFinder>, timeout_destination: &str) {
        self.finder = finder;
        self.timeout_destination = Arc::from(timeout_destination);
    }

    pub fn finder(&self) -> &Arc<dyn ProcessManagerFinder> {
        &self.finder
    }

    pub fn handles(&self, message_type: &str) -> bool {
        self.starts.contains_key(message_type) || self.continuations.contains_key(message_type)
    }

    pub fn register_start<P, M, F>(&mut self, factory: Arc<F>)
    where
        P: StartProcessManager<M>,
        M: Message,
        F: Fn() -> P + Send + Sync + 'static,
    {
        let mapper = build_mapper::<P>();
        let invoke: SagaInvokeFn = Arc::new(move |body: &[u8], scope: SagaScope| -> InvokeFuture {
            let message = codec::deserialize::<M>(body);
            let factory = factory.clone();
            let mapper = mapper.clone();
            Box::pin(async move {
                let message = message?;
                let existing = scope
                    .finder
                    .find_typed::<P::Data, _>(mapper.matcher_for(&message))
                    .await?;
                let saga = factory();

                match existing {
                    Some(stored) => {
                        let mut instance = scope.instance(stored.data);
                        <P as StartProcessManager<M>>::execute(&saga, &message, &mut instance)
                            .await?;
                        scope
                            .finder
                            .update_typed(&PersistanceData {
                                data: instance.data,
                                version: stored.version,
                            })
                            .await?;
                    }
                    None => {
                        let mut data = P::Data::default();
                        data.set_correlation_id(message.correlation_id());
                        let mut instance = scope.instance(data);
                        <P as StartProcessManager<M>>::execute(&saga, &message, &mut instance)
                            .await?;
                        scope.finder.insert_typed(&instance.data).await?;
                    }
                }
                Ok(())
            })
        });

        debug!(
            process_manager = std::any::type_name::<P>(),
            message_type = M::TYPE_NAME,
            "Registered process manager start"
        );
        self.starts
            .entry(M::TYPE_NAME.to_string())
            .or_default()
            .push(SagaEntry {
                saga_type: std::any::type_name::<P>(),
                invoke,
            });
    }

    pub fn register_handler<P, M, F>(&mut self, factory: Arc<F>)
    where
        P: ProcessManagerHandler<M>,
        M: Message,
        F: Fn() -> P + Send + Sync + 'static,
    {
        let mapper = build_mapper::<P>();
        let invoke: SagaInvokeFn = Arc::new(move |body: &[u8], scope: SagaScope| -> InvokeFuture {
            let message = codec::deserialize::<M>(body);
            let factory = factory.clone();
            let mapper = mapper.clone();
            Box::pin(async move {
                let message = message?;
                let Some(stored) = scope
                    .finder
                    .find_typed::<P::Data, _>(mapper.matcher_for(&message))
                    .await?
                else {
                    warn!(
                        process_manager = std::any::type_name::<P>(),
                        message_type = M::TYPE_NAME,
                        correlation_id = %message.correlation_id(),
                        "No process manager data found, skipping"
                    );
                    return Ok(());
                };

                let saga = factory();
                let mut instance = scope.instance(stored.data);
                <P as ProcessManagerHandler<M>>::execute(&saga, &message, &mut instance).await?;

                if instance.is_complete() {
                    scope.finder.delete_typed(&instance.data).await?;
                } else {
                    scope
                        .finder
                        .update_typed(&PersistanceData {
                            data: instance.data,
                            version: stored.version,
                        })
                        .await?;
                }
                Ok(())
            })
        });

        debug!(
            process_manager = std::any::type_name::<P>(),
            message_type = M::TYPE_NAME,
            "Registered process manager handler"
        );
        self.continuations
            .entry(M::TYPE_NAME.to_string())
            .or_default()
            .push(SagaEntry {
                saga_type: std::any::type_name::<P>(),
                invoke,
            });
    }

    /// Run the start and continuation phases for one message.
    pub async fn process(
        &self,
        info: &MessageTypeInfo,
        body: &[u8],
        context: &ConsumeContext,
    ) -> Result<(), HandlerError> {
        let levels = if context.kind() == Some(MessageKind::Send) {
            &info.chain[..]
        } else {
            &info.chain[..1]
        };
        let scope = SagaScope {
            context: context.clone(),
            finder: self.finder.clone(),
            timeout_destination: self.timeout_destination.clone(),
        };

        let (started, continued) = futures::join!(
            Self::run_phase(&self.starts, levels, body, &scope),
            Self::run_phase(&self.continuations, levels, body, &scope),
        );
        started.and(continued)
    }

    async fn run_phase(
        table: &HashMap<String, Vec<SagaEntry>>,
        levels: &[String],
        body: &[u8],
        scope: &SagaScope,
    ) -> Result<(), HandlerError> {
        for message_type in levels {
            let Some(entries) = table.get(message_type) else {
                continue;
            };
            for entry in entries {
                if let Err(e) = (entry.invoke)(body, scope.clone()).await {
                    error!(
                        process_manager = entry.saga_type,
                        message_type = %message_type,
                        error = %e,
                        "Process manager failed"
                    );
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}
