//! The database facade: schema registration, request execution,
//! subscriptions, and block access.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use cid::Cid;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value as Json;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use keel_store::keys::{self, SCHEMA_COLLECTION_PREFIX, SYSTEM_COLLECTION_SEQ};
use keel_store::{Batch, MemStore, Store};

use crate::collection::StoreCtx;
use crate::error::{DbError, Result};
use crate::events::{EventBus, UpdateEvent};
use crate::planner::{ExecEnv, Plan, Planner, Span};
use crate::request::{parse_request, OperationKind, ParsedRequest, Selection};
use crate::schema::{
    compile_sdl, CollectionDescription, Relation, RelationManager, RelationSide, RelationType,
};

/// How long a subscription delivery may block before the receiver is
/// considered too slow and dropped.
const SUBSCRIPTION_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Capacity of each subscription's delivery queue.
const SUBSCRIPTION_QUEUE: usize = 16;

/// A query/mutation result: rendered rows plus any execution-level errors.
#[derive(Debug, Clone, Serialize)]
pub struct ExecResult {
    pub data: Json,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// What a request resolves to at the transport boundary.
pub enum RequestOutcome {
    Result(ExecResult),
    Subscription(mpsc::Receiver<ExecResult>),
}

#[derive(Clone, Debug)]
pub struct Database {
    inner: Arc<DbInner>,
}

#[derive(Debug)]
struct DbInner {
    ctx: StoreCtx,
    collections: RwLock<BTreeMap<String, CollectionDescription>>,
    relations: RwLock<RelationManager>,
    events: EventBus,
    strict_relations: AtomicBool,
}

impl Database {
    /// Open a database over the given store, loading any persisted
    /// collection descriptions.
    pub fn new(store: Arc<dyn Store>) -> Result<Self> {
        let db = Database {
            inner: Arc::new(DbInner {
                ctx: StoreCtx::new(store),
                collections: RwLock::new(BTreeMap::new()),
                relations: RwLock::new(RelationManager::new()),
                events: EventBus::new(),
                strict_relations: AtomicBool::new(false),
            }),
        };
        db.load_descriptions()?;
        Ok(db)
    }

    /// An in-memory database, the test and default-server configuration.
    pub fn new_in_memory() -> Result<Self> {
        Self::new(Arc::new(MemStore::new()))
    }

    /// Opt in to rejecting creates that reference missing related documents.
    /// The permissive behavior is the default contract.
    pub fn set_strict_relations(&self, strict: bool) {
        self.inner.strict_relations.store(strict, Ordering::Relaxed);
    }

    /// Register the collections declared in an SDL document.
    pub fn add_schema(&self, sdl: &str) -> Result<()> {
        let mut collections = self.inner.collections.write();
        let mut staged = RelationManager::new();
        let schemas = compile_sdl(sdl, &mut staged)?;

        for schema in &schemas {
            if collections.contains_key(&schema.name) {
                return Err(DbError::CollectionExists(schema.name.clone()));
            }
        }

        let mut next_id = match self.inner.ctx.store.get(SYSTEM_COLLECTION_SEQ.as_bytes())? {
            Some(bytes) if bytes.len() == 4 => {
                u32::from_be_bytes(bytes.as_ref().try_into().expect("length checked"))
            }
            _ => 1,
        };

        let mut batch = Batch::new();
        for schema in schemas {
            let col = CollectionDescription {
                id: next_id,
                name: schema.name.clone(),
                schema,
            };
            next_id += 1;
            let encoded = serde_json::to_vec(&col)
                .map_err(|err| DbError::Unmarshal(err.to_string()))?;
            batch.put(
                keys::collection_description_key(&col.name).to_vec(),
                Bytes::from(encoded),
            );
            info!(collection = %col.name, id = col.id, "registered collection");
            collections.insert(col.name.clone(), col);
        }
        batch.put(
            SYSTEM_COLLECTION_SEQ.as_bytes().to_vec(),
            Bytes::copy_from_slice(&next_id.to_be_bytes()),
        );
        self.inner.ctx.store.apply(batch)?;

        self.inner.relations.write().absorb(staged);
        Ok(())
    }

    /// Execute a query or mutation. Transport-level failures surface as
    /// `Err`; execution-level failures ride back in `ExecResult::errors`.
    pub fn execute_request(
        &self,
        source: &str,
        variables: Option<&Json>,
        deadline: Option<Instant>,
    ) -> Result<ExecResult> {
        let request = parse_request(source, variables)?;
        if request.kind == OperationKind::Subscription {
            return Err(DbError::Unmarshal(
                "subscriptions require a streaming request".to_string(),
            ));
        }
        self.execute_parsed(request, deadline)
    }

    /// Route a request: plain execution or a subscription stream.
    pub fn handle_request(
        &self,
        source: &str,
        variables: Option<&Json>,
        deadline: Option<Instant>,
    ) -> Result<RequestOutcome> {
        let request = parse_request(source, variables)?;
        if request.kind == OperationKind::Subscription {
            let selection = request.selections.into_iter().next().expect("non-empty");
            Ok(RequestOutcome::Subscription(self.subscribe(selection)?))
        } else {
            Ok(RequestOutcome::Result(self.execute_parsed(request, deadline)?))
        }
    }

    fn execute_parsed(
        &self,
        request: ParsedRequest,
        deadline: Option<Instant>,
    ) -> Result<ExecResult> {
        let mut rows = Vec::new();
        let mut errors = Vec::new();
        let mut events = Vec::new();

        {
            let collections = self.inner.collections.read();
            let relations = self.inner.relations.read();
            let planner = Planner::new(&collections, &relations);
            let env = ExecEnv {
                ctx: &self.inner.ctx,
                collections: &collections,
                deadline,
                strict_relations: self.inner.strict_relations.load(Ordering::Relaxed),
            };

            for selection in &request.selections {
                let outcome = planner
                    .plan(selection, request.kind, request.explain)
                    .and_then(|mut plan: Plan| {
                        let out = plan.run(&env)?;
                        Ok((out, plan.take_events()))
                    });
                match outcome {
                    Ok((mut out, plan_events)) => {
                        rows.append(&mut out);
                        events.extend(plan_events);
                    }
                    Err(err) if err.is_execution_error() => {
                        warn!(%err, "request execution error");
                        errors.push(err.to_string());
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        for event in events {
            self.inner.events.publish(event);
        }

        Ok(ExecResult {
            data: Json::Array(rows),
            errors,
        })
    }

    /// Register a subscription: a task re-runs the selection for every
    /// committed write to the collection and pushes one result per match.
    /// Receivers slower than the send timeout are dropped.
    fn subscribe(&self, selection: Selection) -> Result<mpsc::Receiver<ExecResult>> {
        let collection = selection.name.clone();
        if !self.inner.collections.read().contains_key(&collection) {
            return Err(DbError::CollectionUnknown(collection));
        }

        // Register on the bus before returning, so writes racing with the
        // subscription opening are not lost.
        let mut bus = self.inner.events.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE);
        let db = self.clone();

        tokio::spawn(async move {
            loop {
                let event = match bus.recv().await {
                    Ok(event) if event.collection == collection => event,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "subscription lagged behind the event bus");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let payload = match db.deliver_subscription(&selection, &event) {
                    Ok(result) => result,
                    Err(err) => ExecResult {
                        data: Json::Null,
                        errors: vec![err.to_string()],
                    },
                };
                match tokio::time::timeout(SUBSCRIPTION_SEND_TIMEOUT, tx.send(payload)).await {
                    Ok(Ok(())) => {}
                    _ => {
                        debug!("dropping slow or closed subscription receiver");
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    fn deliver_subscription(
        &self,
        selection: &Selection,
        event: &UpdateEvent,
    ) -> Result<ExecResult> {
        let collections = self.inner.collections.read();
        let relations = self.inner.relations.read();
        let col = collections
            .get(&event.collection)
            .ok_or_else(|| DbError::CollectionUnknown(event.collection.clone()))?;

        let planner = Planner::new(&collections, &relations);
        let mut plan = planner.plan(selection, OperationKind::Query, None)?;
        plan.set_spans(vec![Span::doc(col.id, &event.dockey)]);

        let env = ExecEnv {
            ctx: &self.inner.ctx,
            collections: &collections,
            deadline: Some(Instant::now() + SUBSCRIPTION_SEND_TIMEOUT),
            strict_relations: false,
        };
        let rows = plan.run(&env)?;
        Ok(ExecResult {
            data: Json::Array(rows),
            errors: Vec::new(),
        })
    }

    /// Raw commit block by CID.
    pub fn get_block(&self, cid: &Cid) -> Result<Bytes> {
        Ok(self.inner.ctx.dag.blocks().get(cid)?)
    }

    /// Log the entire store contents.
    pub fn dump(&self) -> Result<()> {
        for (key, value) in self.inner.ctx.store.scan_prefix(b"/")? {
            info!(
                key = %String::from_utf8_lossy(&key),
                len = value.len(),
                "dump"
            );
        }
        Ok(())
    }

    /// Names of the registered collections, in registration-id order.
    pub fn collection_names(&self) -> Vec<String> {
        let collections = self.inner.collections.read();
        let mut names: Vec<(u32, String)> = collections
            .values()
            .map(|col| (col.id, col.name.clone()))
            .collect();
        names.sort();
        names.into_iter().map(|(_, name)| name).collect()
    }

    /// Description of one collection, if registered.
    pub fn collection(&self, name: &str) -> Option<CollectionDescription> {
        self.inner.collections.read().get(name).cloned()
    }

    fn load_descriptions(&self) -> Result<()> {
        let mut collections = self.inner.collections.write();
        let mut relations = self.inner.relations.write();

        let mut sides: BTreeMap<String, Vec<RelationSide>> = BTreeMap::new();
        for (_, bytes) in self
            .inner
            .ctx
            .store
            .scan_prefix(SCHEMA_COLLECTION_PREFIX.as_bytes())?
        {
            let col: CollectionDescription = serde_json::from_slice(&bytes)
                .map_err(|err| DbError::Unmarshal(err.to_string()))?;
            for field in &col.schema.fields {
                if let (Some(rel_name), Some(target)) = (&field.relation_name, &field.schema) {
                    sides.entry(rel_name.clone()).or_default().push(RelationSide {
                        source_type: col.name.clone(),
                        target_type: target.clone(),
                        field_name: field.name.clone(),
                        rel_type: field.relation_type,
                    });
                }
            }
            collections.insert(col.name.clone(), col);
        }

        for (name, mut pair) in sides {
            if pair.len() != 2 {
                return Err(DbError::InvalidRelation(name));
            }
            pair.sort_by(|a, b| a.source_type.cmp(&b.source_type));
            let shape = [
                RelationType::ONEONE,
                RelationType::ONEMANY,
                RelationType::MANYMANY,
            ]
            .into_iter()
            .find(|shape| pair[0].rel_type.contains(*shape))
            .unwrap_or(RelationType::ONEONE);
            let sides: [RelationSide; 2] =
                [pair.remove(0), pair.remove(0)];
            relations.insert(Relation {
                name,
                sides,
                shape,
            });
        }
        Ok(())
    }
}
