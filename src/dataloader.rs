//! Request-scoped batching of downstream fetches
//!
//! Resolvers do not call services themselves. They register a
//! [`FetchDescriptor`] with the request's [`BatchDispatcher`] and await the
//! returned future. When the execution driver has collected a whole level it
//! calls [`BatchDispatcher::dispatch`]: every queued group, keyed by
//! [`BatchKey`], becomes exactly one composite document sent through the
//! service's [`QueryExecutor`](crate::executor::QueryExecutor), and the
//! response is split back so each waiter receives its own slice.
//!
//! Field groups are merged into one selection tree (static prefixes become
//! nested selections, identical selections are sent once, different
//! selections of the same field get `name_1`, `name_2`, ... aliases). Entity
//! groups become one `_entities` call whose representations are in
//! submission order.

use crate::document::{write_selection_set, FieldSelection, Selection, TYPENAME};
use crate::error::{Error, GraphQLError, Result};
use crate::executor::QueryExecutorPool;
use crate::graph::ServiceId;
use crate::middleware::RequestContext;
use crate::types::{GraphQLResponse, OperationKind, PathSegment, SubgraphRequest};
use async_graphql::{indexmap::IndexMap, Name, Value as GqlValue};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

const ENTITIES: &str = "_entities";

/// Namespace of a batch group. Everything under one key is sent together.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum BatchKey {
    Field { service: ServiceId, operation: OperationKind },
    Entity { service: ServiceId, type_name: String },
}

impl BatchKey {
    pub fn service(&self) -> &ServiceId {
        match self {
            BatchKey::Field { service, .. } | BatchKey::Entity { service, .. } => service,
        }
    }
}

/// What one resolver needs from a service.
#[derive(Clone, Debug)]
pub enum FetchDescriptor {
    /// A root (or namespace) field. `prefix` lists the static namespace
    /// fields above it.
    Field { prefix: Vec<String>, field: FieldSelection },
    /// A field of one entity, identified by its representation.
    Entity {
        representation: IndexMap<Name, GqlValue>,
        field: FieldSelection,
    },
}

/// One waiter's slice of a downstream response.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FetchOutcome {
    /// Value of the requested field. `None` when the response carried no
    /// data for the batch at all (for entity groups: no `_entities` list).
    pub data: Option<GqlValue>,
    /// Downstream errors located at or under the requested field, with paths
    /// relative to it.
    pub errors: Vec<GraphQLError>,
}

struct Waiter {
    descriptor: FetchDescriptor,
    sender: oneshot::Sender<Result<FetchOutcome>>,
}

/// Collects fetches of one request and sends them in batches.
///
/// A dispatcher is created per request and dropped with it; nothing is
/// shared between requests.
pub struct BatchDispatcher {
    executors: Arc<QueryExecutorPool>,
    context: Arc<RequestContext>,
    timeout: Option<Duration>,
    queue: Mutex<IndexMap<BatchKey, Vec<Waiter>>>,
}

impl BatchDispatcher {
    pub fn new(executors: Arc<QueryExecutorPool>, context: Arc<RequestContext>, timeout: Option<Duration>) -> Self {
        Self {
            executors,
            context,
            timeout,
            queue: Mutex::new(IndexMap::new()),
        }
    }

    /// Queue a fetch. The returned future completes once the group it
    /// joined has been dispatched.
    pub fn register(
        &self,
        key: BatchKey,
        descriptor: FetchDescriptor,
    ) -> impl Future<Output = Result<FetchOutcome>> + Send + 'static {
        let (sender, receiver) = oneshot::channel();
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_default()
            .push(Waiter { descriptor, sender });

        async move {
            receiver
                .await
                .map_err(|_| Error::Internal("batch was dropped before it was dispatched".to_string()))?
        }
    }

    pub fn has_pending(&self) -> bool {
        !self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Send every queued group, concurrently, and deliver the results.
    /// Returns the number of downstream calls made.
    pub async fn dispatch(&self) -> usize {
        let groups = std::mem::take(&mut *self.queue.lock().unwrap_or_else(PoisonError::into_inner));
        let calls = groups.len();
        join_all(groups.into_iter().map(|(key, waiters)| self.flush(key, waiters))).await;
        calls
    }

    async fn flush(&self, key: BatchKey, waiters: Vec<Waiter>) {
        let service = key.service().clone();
        let plan = match &key {
            BatchKey::Field { operation, .. } => Ok(field_plan(*operation, &waiters)),
            BatchKey::Entity { type_name, .. } => entity_plan(type_name, &waiters),
        };
        let plan = match plan {
            Ok(plan) => plan,
            Err(err) => return fail_all(waiters, &err, &service),
        };

        tracing::debug!(
            service = %service,
            members = waiters.len(),
            query = %plan.request.query,
            "dispatching batch"
        );

        let Some(executor) = self.executors.get(&service) else {
            return fail_all(waiters, &Error::MissingExecutor(service.clone()), &service);
        };
        let call = executor.execute(plan.request, &self.context);
        let result = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    service: service.clone(),
                }),
            },
            None => call.await,
        };

        match result.and_then(|response| split(response, &plan.member_paths, plan.entities, &service)) {
            Ok(outcomes) => {
                for (waiter, outcome) in waiters.into_iter().zip(outcomes) {
                    let _ = waiter.sender.send(Ok(outcome));
                }
            }
            Err(err) => {
                tracing::warn!(service = %service, error = %err, "batch failed");
                fail_all(waiters, &err, &service);
            }
        }
    }
}

impl std::fmt::Debug for BatchDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchDispatcher")
            .field("timeout", &self.timeout)
            .field("pending", &self.has_pending())
            .finish()
    }
}

fn fail_all(waiters: Vec<Waiter>, err: &Error, service: &ServiceId) {
    for waiter in waiters {
        let _ = waiter.sender.send(Err(err.fan_out(service)));
    }
}

struct GroupPlan {
    request: SubgraphRequest,
    /// Location of each member's value in the response data.
    member_paths: Vec<Vec<PathSegment>>,
    entities: bool,
}

/// Response keys handed out inside one selection set.
#[derive(Default)]
struct SelectionKeys {
    by_selection: HashMap<String, String>,
    used: HashSet<String>,
}

impl SelectionKeys {
    /// Key of `field` and whether it is a selection not seen before.
    fn assign(&mut self, field: &FieldSelection) -> (String, bool) {
        let rendered = field.unaliased().to_string();
        if let Some(key) = self.by_selection.get(&rendered) {
            return (key.clone(), false);
        }
        let mut key = field.name.clone();
        let mut n = 1;
        while self.used.contains(&key) {
            key = format!("{}_{n}", field.name);
            n += 1;
        }
        self.used.insert(key.clone());
        self.by_selection.insert(rendered, key.clone());
        (key, true)
    }

    /// Add `field` to `fields` unless an identical selection is there; returns
    /// its response key.
    fn add(&mut self, fields: &mut Vec<FieldSelection>, field: &FieldSelection) -> String {
        let (key, new) = self.assign(field);
        if new {
            let mut field = field.unaliased();
            if key != field.name {
                field.alias = Some(key.clone());
            }
            fields.push(field);
        }
        key
    }
}

#[derive(Default)]
struct PrefixNode {
    children: IndexMap<String, PrefixNode>,
    keys: SelectionKeys,
    fields: Vec<FieldSelection>,
}

impl PrefixNode {
    fn insert(&mut self, prefix: &[String], field: &FieldSelection) -> String {
        match prefix.split_first() {
            Some((head, rest)) => {
                self.keys.used.insert(head.clone());
                self.children.entry(head.clone()).or_default().insert(rest, field)
            }
            None => self.keys.add(&mut self.fields, field),
        }
    }

    fn selections(&self) -> Vec<Selection> {
        let mut out: Vec<Selection> = self.fields.iter().cloned().map(Selection::Field).collect();
        for (name, child) in &self.children {
            let mut field = FieldSelection::new(name.as_str());
            field.selections = child.selections();
            out.push(Selection::Field(field));
        }
        out
    }
}

fn field_plan(operation: OperationKind, waiters: &[Waiter]) -> GroupPlan {
    let mut root = PrefixNode::default();
    let mut member_paths = Vec::with_capacity(waiters.len());

    for waiter in waiters {
        let (prefix, field) = match &waiter.descriptor {
            FetchDescriptor::Field { prefix, field } => (prefix.as_slice(), field),
            FetchDescriptor::Entity { field, .. } => (&[][..], field),
        };
        let key = root.insert(prefix, field);
        let mut path: Vec<PathSegment> = prefix.iter().map(|p| PathSegment::Field(p.clone())).collect();
        path.push(PathSegment::Field(key));
        member_paths.push(path);
    }

    let mut query = operation.keyword().to_string();
    query.push(' ');
    // Writing into a String cannot fail.
    let _ = write_selection_set(&mut query, &root.selections());

    GroupPlan {
        request: SubgraphRequest::new(query),
        member_paths,
        entities: false,
    }
}

fn entity_plan(type_name: &str, waiters: &[Waiter]) -> Result<GroupPlan> {
    let mut keys = SelectionKeys::default();
    keys.used.insert(TYPENAME.to_string());
    let mut fields = Vec::new();
    // Identical representations share one `_entities` slot.
    let mut representations: IndexMap<String, serde_json::Value> = IndexMap::new();
    let mut member_paths = Vec::with_capacity(waiters.len());

    for waiter in waiters {
        let (representation, field) = match &waiter.descriptor {
            FetchDescriptor::Entity { representation, field } => (representation, field),
            FetchDescriptor::Field { field, .. } => {
                return Err(Error::Internal(format!(
                    "field fetch `{}` queued in the `{type_name}` entity batch",
                    field.name
                )))
            }
        };
        let key = keys.add(&mut fields, field);
        let json = GqlValue::Object(representation.clone()).into_json()?;
        let (index, _) = representations.insert_full(json.to_string(), json);
        member_paths.push(vec![
            PathSegment::Field(ENTITIES.to_string()),
            PathSegment::Index(index),
            PathSegment::Field(key),
        ]);
    }

    Ok(GroupPlan {
        request: SubgraphRequest::new(entities_query(type_name, &fields))
            .variable(
                "representations",
                serde_json::Value::Array(representations.into_values().collect()),
            ),
        member_paths,
        entities: true,
    })
}

/// The `_entities` document selecting `fields` on `type_name`.
pub fn entities_query(type_name: &str, fields: &[FieldSelection]) -> String {
    let mut selections = vec![Selection::Field(FieldSelection::typename())];
    selections.extend(fields.iter().cloned().map(Selection::Field));

    let mut query = format!(
        "query($representations: [_Any!]!) {{ {ENTITIES}(representations: $representations) {{ ... on {type_name} "
    );
    let _ = write_selection_set(&mut query, &selections);
    query.push_str(" } }");
    query
}

fn split(
    response: GraphQLResponse,
    member_paths: &[Vec<PathSegment>],
    entities: bool,
    service: &ServiceId,
) -> Result<Vec<FetchOutcome>> {
    let data = response.data.map(GqlValue::from_json).transpose()?;
    let has_data = !entities
        || matches!(
            data.as_ref().and_then(|d| walk(d, &[PathSegment::Field(ENTITIES.to_string())])),
            Some(GqlValue::List(_))
        );

    let outcomes = member_paths
        .iter()
        .map(|path| {
            let value = if has_data {
                data.as_ref().map(|d| walk(d, path).cloned().unwrap_or(GqlValue::Null))
            } else {
                None
            };
            let errors = response
                .errors
                .iter()
                .filter_map(|error| {
                    let rest = relative_path(&error.path, path)?;
                    let mut error = error.clone().with_path(rest);
                    error
                        .extensions
                        .entry("service".to_string())
                        .or_insert_with(|| serde_json::json!(service.as_str()));
                    Some(error)
                })
                .collect();
            FetchOutcome { data: value, errors }
        })
        .collect();
    Ok(outcomes)
}

/// Path of an error relative to a member. Errors above the member (including
/// path-less ones) concern it as a whole.
fn relative_path(error: &[PathSegment], member: &[PathSegment]) -> Option<Vec<PathSegment>> {
    if error.len() >= member.len() {
        error.starts_with(member).then(|| error[member.len()..].to_vec())
    } else {
        member.starts_with(error).then(Vec::new)
    }
}

pub(crate) fn walk<'a>(value: &'a GqlValue, path: &[PathSegment]) -> Option<&'a GqlValue> {
    path.iter().try_fold(value, |value, segment| match (value, segment) {
        (GqlValue::Object(map), PathSegment::Field(name)) => map.get(name.as_str()),
        (GqlValue::List(items), PathSegment::Index(index)) => items.get(*index),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::QueryExecutor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records every request and answers with a fixed response.
    struct Recording {
        calls: AtomicUsize,
        requests: Mutex<Vec<SubgraphRequest>>,
        response: serde_json::Value,
        delay: Option<Duration>,
    }

    impl Recording {
        fn new(response: serde_json::Value) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
                response,
                delay: None,
            })
        }
    }

    #[async_trait::async_trait]
    impl QueryExecutor for Recording {
        async fn execute(&self, request: SubgraphRequest, _ctx: &RequestContext) -> Result<GraphQLResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(serde_json::from_value(self.response.clone()).unwrap())
        }
    }

    fn dispatcher(executors: Vec<(&str, Arc<Recording>)>, timeout: Option<Duration>) -> BatchDispatcher {
        let mut pool = QueryExecutorPool::new();
        for (name, executor) in executors {
            pool.add(name, executor);
        }
        BatchDispatcher::new(Arc::new(pool), Arc::new(RequestContext::default()), timeout)
    }

    fn field_key(service: &str) -> BatchKey {
        BatchKey::Field {
            service: ServiceId::new(service),
            operation: OperationKind::Query,
        }
    }

    fn root_field(field: FieldSelection) -> FetchDescriptor {
        FetchDescriptor::Field { prefix: Vec::new(), field }
    }

    #[tokio::test]
    async fn one_call_per_namespace() {
        let products = Recording::new(serde_json::json!({
            "data": { "a": 1, "b": 2, "b_1": 3 }
        }));
        let loader = dispatcher(vec![("products", products.clone())], None);

        let a = loader.register(field_key("products"), root_field(FieldSelection::new("a")));
        let b = loader.register(field_key("products"), root_field(FieldSelection::new("b").argument("x", 1)));
        let b_again = loader.register(field_key("products"), root_field(FieldSelection::new("b").argument("x", 1)));
        let b_other = loader.register(field_key("products"), root_field(FieldSelection::new("b").argument("x", 2)));
        assert!(loader.has_pending());

        assert_eq!(loader.dispatch().await, 1);
        assert!(!loader.has_pending());
        assert_eq!(products.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            products.requests.lock().unwrap()[0].query,
            "query { a b(x: 1) b_1: b(x: 2) }"
        );

        assert_eq!(a.await.unwrap().data, Some(GqlValue::from(1)));
        assert_eq!(b.await.unwrap().data, Some(GqlValue::from(2)));
        assert_eq!(b_again.await.unwrap().data, Some(GqlValue::from(2)));
        assert_eq!(b_other.await.unwrap().data, Some(GqlValue::from(3)));
    }

    #[tokio::test]
    async fn separate_namespaces_are_separate_calls() {
        let a = Recording::new(serde_json::json!({ "data": { "x": 1 } }));
        let b = Recording::new(serde_json::json!({ "data": { "y": 2 } }));
        let loader = dispatcher(vec![("a", a.clone()), ("b", b.clone())], None);

        let x = loader.register(field_key("a"), root_field(FieldSelection::new("x")));
        let y = loader.register(field_key("b"), root_field(FieldSelection::new("y")));

        assert_eq!(loader.dispatch().await, 2);
        assert_eq!(a.calls.load(Ordering::SeqCst) + b.calls.load(Ordering::SeqCst), 2);
        assert_eq!(x.await.unwrap().data, Some(GqlValue::from(1)));
        assert_eq!(y.await.unwrap().data, Some(GqlValue::from(2)));
    }

    #[tokio::test]
    async fn static_prefixes_nest_selections() {
        let accounts = Recording::new(serde_json::json!({
            "data": { "viewer": { "name": "Ada", "settings": { "theme": "dark" } } }
        }));
        let loader = dispatcher(vec![("accounts", accounts.clone())], None);

        let name = loader.register(
            field_key("accounts"),
            FetchDescriptor::Field {
                prefix: vec!["viewer".into()],
                field: FieldSelection::new("name"),
            },
        );
        let theme = loader.register(
            field_key("accounts"),
            FetchDescriptor::Field {
                prefix: vec!["viewer".into(), "settings".into()],
                field: FieldSelection::new("theme"),
            },
        );
        loader.dispatch().await;

        assert_eq!(
            accounts.requests.lock().unwrap()[0].query,
            "query { viewer { name settings { theme } } }"
        );
        assert_eq!(name.await.unwrap().data, Some(GqlValue::from("Ada")));
        assert_eq!(theme.await.unwrap().data, Some(GqlValue::from("dark")));
    }

    #[tokio::test]
    async fn entity_batches_keep_submission_order() {
        let inventory = Recording::new(serde_json::json!({
            "data": { "_entities": [
                { "__typename": "Product", "price": 9.99 },
                { "__typename": "Product", "price": 5.0 }
            ] }
        }));
        let loader = dispatcher(vec![("inventory", inventory.clone())], None);
        let key = BatchKey::Entity {
            service: ServiceId::new("inventory"),
            type_name: "Product".into(),
        };

        let fetch = |id: &str| {
            let mut representation = IndexMap::new();
            representation.insert(Name::new("__typename"), GqlValue::from("Product"));
            representation.insert(Name::new("id"), GqlValue::from(id));
            loader.register(
                key.clone(),
                FetchDescriptor::Entity {
                    representation,
                    field: FieldSelection::new("price"),
                },
            )
        };
        let first = fetch("p1");
        let second = fetch("p2");
        loader.dispatch().await;

        let request = inventory.requests.lock().unwrap()[0].clone();
        assert_eq!(
            request.query,
            "query($representations: [_Any!]!) { _entities(representations: $representations) { ... on Product { __typename price } } }"
        );
        assert_eq!(
            request.variables["representations"],
            serde_json::json!([
                { "__typename": "Product", "id": "p1" },
                { "__typename": "Product", "id": "p2" }
            ])
        );
        assert_eq!(first.await.unwrap().data, Some(GqlValue::from(9.99)));
        assert_eq!(second.await.unwrap().data, Some(GqlValue::from(5.0)));
    }

    #[tokio::test]
    async fn missing_entities_list_yields_no_data() {
        let inventory = Recording::new(serde_json::json!({ "data": {} }));
        let loader = dispatcher(vec![("inventory", inventory)], None);

        let pending = loader.register(
            BatchKey::Entity {
                service: ServiceId::new("inventory"),
                type_name: "Product".into(),
            },
            FetchDescriptor::Entity {
                representation: IndexMap::new(),
                field: FieldSelection::new("price"),
            },
        );
        loader.dispatch().await;

        assert_eq!(pending.await.unwrap().data, None);
    }

    #[tokio::test]
    async fn errors_are_routed_by_path() {
        let products = Recording::new(serde_json::json!({
            "data": { "a": null, "b": { "c": null } },
            "errors": [
                { "message": "a failed", "path": ["a"] },
                { "message": "c failed", "path": ["b", "c"] },
                { "message": "everything failed" }
            ]
        }));
        let loader = dispatcher(vec![("products", products)], None);

        let a = loader.register(field_key("products"), root_field(FieldSelection::new("a")));
        let b = loader.register(
            field_key("products"),
            root_field(FieldSelection::new("b").selection(FieldSelection::new("c").into())),
        );
        loader.dispatch().await;

        let a = a.await.unwrap();
        assert_eq!(
            a.errors.iter().map(|e| e.message.as_str()).collect::<Vec<_>>(),
            vec!["a failed", "everything failed"]
        );
        let b = b.await.unwrap();
        assert_eq!(b.errors[0].message, "c failed");
        assert_eq!(b.errors[0].path, vec![PathSegment::from("c")]);
        assert_eq!(b.errors[0].extensions["service"], serde_json::json!("products"));
    }

    #[tokio::test]
    async fn timeout_fails_every_member() {
        let slow = Arc::new(Recording {
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            response: serde_json::json!({ "data": { "a": 1 } }),
            delay: Some(Duration::from_millis(200)),
        });
        let loader = dispatcher(vec![("slow", slow)], Some(Duration::from_millis(10)));

        let a = loader.register(field_key("slow"), root_field(FieldSelection::new("a")));
        let b = loader.register(field_key("slow"), root_field(FieldSelection::new("b")));
        loader.dispatch().await;

        assert!(matches!(a.await, Err(Error::Timeout { .. })));
        assert!(matches!(b.await, Err(Error::Timeout { .. })));
    }

    #[tokio::test]
    async fn missing_executor_fails_the_group() {
        let loader = dispatcher(Vec::new(), None);
        let a = loader.register(field_key("ghost"), root_field(FieldSelection::new("a")));
        loader.dispatch().await;

        let err = a.await.unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }
}
