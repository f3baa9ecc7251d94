//! In-process host
//!
//! [`InMemoryHost`] answers the subset of the host protocol the stacker
//! uses, backed by plain in-memory tables. It is used by the `demo` command,
//! the integration tests and the benches.
//!
//! # Features
//!
//! - **Data sets**: hierarchical collections with host-assigned ids on data
//!   sets, collections and attributes; each collection reports the one
//!   before it as its parent, by id
//! - **Cases**: counting, indexed lookup, single and batched creation,
//!   deleting all cases
//! - **Frame**: `interactiveFrame` get/update including the persisted state
//! - **Transcript**: every request received, in order
//! - **Fault injection**: make matching requests fail, time out, or be applied
//!   with the reply lost
//! - **Notifications**: push host-initiated messages to the attached plugin
//!
//! # Example
//!
//! ```ignore
//! let host = Arc::new(InMemoryHost::new());
//! host.add_data_set(schema);
//! host.inject(Fault::fail(Action::Create, "collection[people].case").times(1));
//!
//! let bridge = Arc::new(Bridge::new(host.clone()));
//! ```

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::bridge::{Action, HostChannel, InboundHandler, Request, Response};
use crate::error::{Result, StackerError};
use crate::reshape::DataSetSchema;
use crate::selector::ResourceSelector;

/// What an injected fault does to a matching request
#[derive(Debug, Clone, PartialEq)]
pub enum FaultEffect {
    /// Reply `success: false` without applying the request
    Fail(String),
    /// Never reply and do not apply the request
    Timeout,
    /// Apply the request but never reply
    LoseReply,
}

/// Rule matching requests by action and resource substring
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    action: Action,
    resource: String,
    effect: FaultEffect,
    remaining: Option<usize>,
}

impl Fault {
    pub fn new(action: Action, resource: impl Into<String>, effect: FaultEffect) -> Self {
        Self {
            action,
            resource: resource.into(),
            effect,
            remaining: None,
        }
    }

    pub fn fail(action: Action, resource: impl Into<String>) -> Self {
        Self::new(
            action,
            resource,
            FaultEffect::Fail("injected failure".to_string()),
        )
    }

    pub fn timeout(action: Action, resource: impl Into<String>) -> Self {
        Self::new(action, resource, FaultEffect::Timeout)
    }

    pub fn lose_reply(action: Action, resource: impl Into<String>) -> Self {
        Self::new(action, resource, FaultEffect::LoseReply)
    }

    /// Only trigger for the next `n` matching requests
    #[must_use]
    pub fn times(mut self, n: usize) -> Self {
        self.remaining = Some(n);
        self
    }

    fn matches(&self, request: &Request) -> bool {
        self.remaining != Some(0)
            && self.action == request.action
            && request.resource.contains(&self.resource)
    }
}

/// A case as stored by the host
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCase {
    pub id: i64,
    pub parent: Option<i64>,
    pub values: Map<String, Value>,
}

#[derive(Debug, Clone)]
struct StoredDataSet {
    id: i64,
    schema: DataSetSchema,
    cases: BTreeMap<String, Vec<StoredCase>>,
}

impl StoredDataSet {
    fn collection_name(&self, selector: &ResourceSelector) -> Option<String> {
        match selector.get("collection") {
            Some(name) => self.schema.collection(name).map(|c| c.name.clone()),
            None => self.schema.last_collection().map(|c| c.name.clone()),
        }
    }

    fn has_case(&self, id: i64) -> bool {
        self.cases.values().flatten().any(|c| c.id == id)
    }

    fn summary(&self) -> Value {
        json!({
            "name": self.schema.name,
            "title": self.schema.title.clone().unwrap_or_else(|| self.schema.name.clone()),
            "id": self.id,
        })
    }
}

#[derive(Debug, Default)]
struct HostData {
    data_sets: Vec<StoredDataSet>,
    frame: Map<String, Value>,
    components: Vec<Value>,
    log_messages: Vec<String>,
    transcript: Vec<Request>,
    faults: Vec<Fault>,
    next_id: i64,
}

impl HostData {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn data_set(&self, name: &str) -> Option<&StoredDataSet> {
        self.data_sets.iter().find(|d| d.schema.name == name)
    }

    fn data_set_mut(&mut self, name: &str) -> Option<&mut StoredDataSet> {
        self.data_sets.iter_mut().find(|d| d.schema.name == name)
    }

    fn add_data_set(&mut self, mut schema: DataSetSchema) -> i64 {
        let id = self.next_id();
        schema.extra.insert("id".to_string(), json!(id));
        let mut previous: Option<i64> = None;
        let mut cases = BTreeMap::new();
        for collection in &mut schema.collections {
            let collection_id = self.next_id();
            collection.extra.insert("id".to_string(), json!(collection_id));
            collection.parent = previous.map(|id| json!(id));
            for attr in &mut collection.attrs {
                let attr_id = self.next_id();
                attr.properties.insert("id".to_string(), json!(attr_id));
                attr.properties.insert("guid".to_string(), json!(attr_id));
            }
            previous = Some(collection_id);
            cases.insert(collection.name.clone(), Vec::new());
        }
        self.data_sets.push(StoredDataSet { id, schema, cases });
        id
    }

    /// Take the effect of the first live fault matching `request`
    fn take_fault(&mut self, request: &Request) -> Option<FaultEffect> {
        let fault = self.faults.iter_mut().find(|f| f.matches(request))?;
        if let Some(remaining) = fault.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(fault.effect.clone())
    }

    fn route(&mut self, request: &Request) -> Response {
        let selector = request.selector();
        match (request.action, selector.kind()) {
            (Action::Get, "interactiveFrame") => {
                Response::ok_with(Value::Object(self.frame.clone()))
            }
            (Action::Update, "interactiveFrame") => {
                if let Some(Value::Object(values)) = &request.values {
                    for (key, value) in values {
                        self.frame.insert(key.clone(), value.clone());
                    }
                }
                Response::ok()
            }
            (Action::Get, "dataContextList") => Response::ok_with(Value::Array(
                self.data_sets.iter().map(StoredDataSet::summary).collect(),
            )),
            (Action::Create, "dataContext") => self.create_data_set(request.values.as_ref()),
            (Action::Get, "dataContext") => {
                match selector.get("dataContext").and_then(|name| self.data_set(name)) {
                    Some(data_set) => match serde_json::to_value(&data_set.schema) {
                        Ok(schema) => Response::ok_with(schema),
                        Err(e) => Response::failure_with(e.to_string()),
                    },
                    None => no_such_data_set(&selector),
                }
            }
            (Action::Delete, "dataContext") => {
                let name = selector.get("dataContext").unwrap_or_default();
                let before = self.data_sets.len();
                self.data_sets.retain(|d| d.schema.name != name);
                if self.data_sets.len() < before {
                    Response::ok()
                } else {
                    no_such_data_set(&selector)
                }
            }
            (Action::Get, "caseCount") => self.with_collection(&selector, |data_set, collection| {
                let count = data_set.cases.get(collection).map_or(0, Vec::len);
                Response::ok_with(json!(count))
            }),
            (Action::Get, "caseByIndex") => {
                let index = selector.get("caseByIndex").and_then(|i| i.parse::<usize>().ok());
                self.with_collection(&selector, |data_set, collection| {
                    let case = index.and_then(|i| data_set.cases.get(collection)?.get(i));
                    match case {
                        Some(case) => Response::ok_with(json!({
                            "case": {
                                "id": case.id,
                                "parent": case.parent,
                                "collection": {"name": collection},
                                "values": case.values,
                            }
                        })),
                        None => Response::failure_with(format!(
                            "no case at index {}",
                            selector.get("caseByIndex").unwrap_or_default()
                        )),
                    }
                })
            }
            (Action::Create, "case") => self.create_cases(&selector, request.values.as_ref()),
            (Action::Delete, "allCases") => {
                match selector.get("dataContext").and_then(|name| self.data_set_mut(name)) {
                    Some(data_set) => {
                        data_set.cases.values_mut().for_each(Vec::clear);
                        Response::ok()
                    }
                    None => no_such_data_set(&selector),
                }
            }
            (Action::Create, "component") => {
                let id = self.next_id();
                let mut component = request.values.clone().unwrap_or_else(|| json!({}));
                if let Value::Object(map) = &mut component {
                    map.insert("id".to_string(), json!(id));
                }
                self.components.push(component);
                Response::ok_with(json!({ "id": id }))
            }
            (Action::Notify, "logMessage") => {
                let message = request
                    .values
                    .as_ref()
                    .and_then(|v| v.get("formatStr"))
                    .and_then(Value::as_str);
                match message {
                    Some(message) => {
                        self.log_messages.push(message.to_string());
                        Response::ok()
                    }
                    None => Response::failure_with("logMessage needs a formatStr"),
                }
            }
            _ => Response::failure_with(format!("unsupported request '{}'", request.describe())),
        }
    }

    fn with_collection<F>(&self, selector: &ResourceSelector, f: F) -> Response
    where
        F: FnOnce(&StoredDataSet, &str) -> Response,
    {
        let Some(data_set) = selector.get("dataContext").and_then(|name| self.data_set(name)) else {
            return no_such_data_set(selector);
        };
        match data_set.collection_name(selector) {
            Some(collection) => f(data_set, &collection),
            None => Response::failure_with(format!(
                "no collection '{}'",
                selector.get("collection").unwrap_or_default()
            )),
        }
    }

    fn create_data_set(&mut self, values: Option<&Value>) -> Response {
        let Some(values) = values else {
            return Response::failure_with("missing data set definition");
        };
        let schema: DataSetSchema = match serde_json::from_value(values.clone()) {
            Ok(schema) => schema,
            Err(e) => return Response::failure_with(format!("bad data set definition: {}", e)),
        };
        if self.data_set(&schema.name).is_some() {
            return Response::failure_with(format!("data set '{}' already exists", schema.name));
        }
        let name = schema.name.clone();
        let id = self.add_data_set(schema);
        Response::ok_with(json!({ "id": id, "name": name }))
    }

    fn create_cases(&mut self, selector: &ResourceSelector, values: Option<&Value>) -> Response {
        let requested: Vec<Value> = match values {
            Some(Value::Array(items)) => items.clone(),
            Some(item) if item.is_object() => vec![item.clone()],
            _ => return Response::failure_with("case creation needs values"),
        };

        let Some(name) = selector.get("dataContext").map(str::to_string) else {
            return no_such_data_set(selector);
        };
        let Some(collection) = self.data_set(&name).and_then(|d| d.collection_name(selector)) else {
            return Response::failure_with(format!(
                "no collection '{}' in '{}'",
                selector.get("collection").unwrap_or_default(),
                name
            ));
        };

        let mut created = Vec::with_capacity(requested.len());
        for item in &requested {
            let parent = item.get("parent").and_then(Value::as_i64);
            if let Some(parent) = parent {
                let known = self.data_set(&name).is_some_and(|d| d.has_case(parent));
                if !known {
                    return Response::failure_with(format!("no parent case {}", parent));
                }
            }
            let case_values = item
                .get("values")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            created.push((parent, case_values));
        }

        let mut ids = Vec::with_capacity(created.len());
        for (parent, case_values) in created {
            let id = self.next_id();
            if let Some(cases) = self
                .data_set_mut(&name)
                .and_then(|d| d.cases.get_mut(&collection))
            {
                cases.push(StoredCase {
                    id,
                    parent,
                    values: case_values,
                });
            }
            ids.push(json!({ "id": id }));
        }
        Response::ok_with(Value::Array(ids))
    }
}

fn no_such_data_set(selector: &ResourceSelector) -> Response {
    Response::failure_with(format!(
        "no data set '{}'",
        selector.get("dataContext").unwrap_or_default()
    ))
}

/// Host application simulated in memory
#[derive(Default)]
pub struct InMemoryHost {
    data: Mutex<HostData>,
    handler: RwLock<Option<Weak<dyn InboundHandler>>>,
}

impl InMemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HostData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a data set; the host assigns ids. Returns the data set id.
    pub fn add_data_set(&self, schema: DataSetSchema) -> i64 {
        self.lock().add_data_set(schema)
    }

    /// Add one case to a collection. Returns the case id.
    pub fn add_case(
        &self,
        data_set: &str,
        collection: &str,
        parent: Option<i64>,
        values: Value,
    ) -> Result<i64> {
        let selector = ResourceSelector::root("dataContext", data_set)
            .child("collection", collection)
            .leaf("case");
        let response = self
            .lock()
            .create_cases(&selector, Some(&json!({ "parent": parent, "values": values })));
        if !response.success {
            return Err(StackerError::host_failure(
                selector.to_string(),
                response.error_message(),
            ));
        }
        response
            .values
            .as_ref()
            .and_then(|v| v.get(0))
            .and_then(|c| c.get("id"))
            .and_then(Value::as_i64)
            .ok_or_else(|| StackerError::Protocol("case created without an id".to_string()))
    }

    /// Seed the persisted interactive state
    pub fn set_interactive_state(&self, state: Value) {
        self.lock().frame.insert("state".to_string(), state);
    }

    pub fn interactive_state(&self) -> Option<Value> {
        self.lock().frame.get("state").cloned()
    }

    /// Everything the plugin declared through `update interactiveFrame`
    pub fn frame(&self) -> Value {
        Value::Object(self.lock().frame.clone())
    }

    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push(fault);
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Every request received, batches flattened, in arrival order
    pub fn transcript(&self) -> Vec<Request> {
        self.lock().transcript.clone()
    }

    /// Number of received requests with `action` whose resource contains `fragment`
    pub fn count_requests(&self, action: Action, fragment: &str) -> usize {
        self.lock()
            .transcript
            .iter()
            .filter(|r| r.action == action && r.resource.contains(fragment))
            .count()
    }

    pub fn data_set_names(&self) -> Vec<String> {
        self.lock()
            .data_sets
            .iter()
            .map(|d| d.schema.name.clone())
            .collect()
    }

    /// Stored schema of a data set, host ids included
    pub fn data_set(&self, name: &str) -> Option<DataSetSchema> {
        self.lock().data_set(name).map(|d| d.schema.clone())
    }

    pub fn cases(&self, data_set: &str, collection: &str) -> Vec<StoredCase> {
        self.lock()
            .data_set(data_set)
            .and_then(|d| d.cases.get(collection).cloned())
            .unwrap_or_default()
    }

    pub fn components(&self) -> Vec<Value> {
        self.lock().components.clone()
    }

    pub fn log_messages(&self) -> Vec<String> {
        self.lock().log_messages.clone()
    }

    /// Send a host-initiated message to the attached plugin.
    ///
    /// Returns the plugin's reply, or `None` when nothing is attached.
    pub fn notify_plugin(&self, request: &Request) -> Option<Response> {
        let handler = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)?;
        let message = serde_json::to_value(request).ok()?;
        serde_json::from_value(handler.handle(message)).ok()
    }

    /// Handle one request; `None` means the reply is never sent
    fn process(&self, message: Value) -> Option<Value> {
        let request: Request = match serde_json::from_value(message) {
            Ok(request) => request,
            Err(e) => {
                return serde_json::to_value(Response::failure_with(format!(
                    "malformed request: {}",
                    e
                )))
                .ok()
            }
        };

        let mut data = self.lock();
        data.transcript.push(request.clone());
        let response = match data.take_fault(&request) {
            Some(FaultEffect::Fail(message)) => Response::failure_with(message),
            Some(FaultEffect::Timeout) => return None,
            Some(FaultEffect::LoseReply) => {
                data.route(&request);
                return None;
            }
            None => data.route(&request),
        };
        drop(data);

        tracing::trace!(
            "host: {} -> {}",
            request.describe(),
            if response.success { "ok" } else { "failed" }
        );
        serde_json::to_value(response).ok()
    }
}

#[async_trait]
impl HostChannel for InMemoryHost {
    fn attach(&self, handler: Weak<dyn InboundHandler>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    async fn call(&self, message: Value) -> Result<Option<Value>> {
        match message {
            Value::Array(items) => {
                let mut replies = Vec::with_capacity(items.len());
                for item in items {
                    match self.process(item) {
                        Some(reply) => replies.push(reply),
                        None => return Ok(None),
                    }
                }
                Ok(Some(Value::Array(replies)))
            }
            single => Ok(self.process(single)),
        }
    }
}
