//! Closure based class registry.

use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::debug;
use uuid::Uuid;

use super::{request_args, Adapter, CallRequest, CallbackHandler, CallbackSink, Invocation};
use crate::rpc::common::{json_signature, strip_signature, CREATE, CREATE_NAMED, DELETE, GET_NAMED};

type Object = Box<dyn Any + Send>;
type Constructor = Arc<dyn Fn(&Invocation) -> Result<Object, String> + Send + Sync>;
type MemberFn = Arc<dyn Fn(&mut Object, &Invocation) -> Result<Value, String> + Send + Sync>;
type StaticFn = Arc<dyn Fn(&Invocation) -> Result<Value, String> + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Describes one class: constructor, member and static functions.
///
/// Function names may carry a `-signature` suffix to register overloads, e.g.
/// `add-numbernumber` and `add-stringstring`. Calls arrive under the stripped
/// name and are routed by the JSON types of their arguments.
pub struct ClassBuilder<T> {
    name: String,
    constructor: Constructor,
    members: Vec<(String, MemberFn)>,
    statics: Vec<(String, StaticFn)>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Any + Send> ClassBuilder<T> {
    pub fn new<F>(name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&Invocation) -> Result<T, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            constructor: Arc::new(move |inv: &Invocation| constructor(inv).map(|object| Box::new(object) as Object)),
            members: Vec::new(),
            statics: Vec::new(),
            _marker: PhantomData,
        }
    }

    pub fn member<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut T, &Invocation) -> Result<Value, String> + Send + Sync + 'static,
    {
        let class_name = self.name.clone();
        let member: MemberFn = Arc::new(move |object: &mut Object, inv: &Invocation| {
            let this = object
                .downcast_mut::<T>()
                .ok_or_else(|| format!("Instance is not of class {}", class_name))?;
            f(this, inv)
        });
        self.members.push((name.into(), member));
        self
    }

    pub fn static_fn<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Invocation) -> Result<Value, String> + Send + Sync + 'static,
    {
        let function: StaticFn = Arc::new(f);
        self.statics.push((name.into(), function));
        self
    }
}

struct ClassEntry {
    constructor: Constructor,
    members: Vec<(String, MemberFn)>,
    statics: Vec<(String, StaticFn)>,
}

struct InstanceEntry {
    class_name: String,
    object: Arc<Mutex<Object>>,
}

/// Pick the overload for `method`: exact name, then matching signature, then first candidate
fn resolve<'a, F>(functions: &'a [(String, F)], method: &str, args: &[Value]) -> Option<&'a F> {
    if let Some((_, f)) = functions.iter().find(|(name, _)| name == method) {
        return Some(f);
    }
    let signature = json_signature(args);
    let mut candidates = functions.iter().filter(|(name, _)| strip_signature(name) == method);
    let first = candidates.clone().next().map(|(_, f)| f);
    candidates
        .find(|(name, _)| name[method.len()..] == signature)
        .map(|(_, f)| f)
        .or(first)
}

/// Registry of classes and their live instances
#[derive(Default)]
pub struct ClassRegistry {
    classes: RwLock<BTreeMap<String, ClassEntry>>,
    instances: Mutex<HashMap<String, InstanceEntry>>,
    sink: CallbackSink,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a class
    pub fn register<T: Any + Send>(&self, builder: ClassBuilder<T>) {
        debug!("Registering class: {}", builder.name);
        if let Ok(mut classes) = self.classes.write() {
            classes.insert(
                builder.name,
                ClassEntry {
                    constructor: builder.constructor,
                    members: builder.members,
                    statics: builder.statics,
                },
            );
        }
    }

    /// Ids of the live instances of a class, sorted
    pub fn instance_ids(&self, class_name: &str) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.instances)
            .iter()
            .filter(|(_, entry)| entry.class_name == class_name)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn invocation(&self, request: &CallRequest, args: Vec<Value>) -> Invocation {
        Invocation::new(request.sender.clone(), args, self.sink.clone())
    }

    fn construct(&self, request: &CallRequest, args: Vec<Value>) -> Result<Object, String> {
        let constructor = {
            let classes = self.classes.read().map_err(|e| e.to_string())?;
            let entry = classes
                .get(&request.class_name)
                .ok_or_else(|| format!("Could not find class: {}", request.class_name))?;
            entry.constructor.clone()
        };
        constructor(&self.invocation(request, args))
    }

    fn create(&self, request: &CallRequest) -> Result<Value, String> {
        let object = self.construct(request, request_args(request))?;
        let instance_id = format!("{}-{}", request.class_name, &Uuid::new_v4().simple().to_string()[..12]);
        self.insert(&request.class_name, &instance_id, object);
        Ok(Value::String(instance_id))
    }

    fn create_named(&self, request: &CallRequest) -> Result<Value, String> {
        let mut args = request_args(request);
        if args.is_empty() {
            return Err("Missing instance name".to_string());
        }
        let instance_id = match args.remove(0) {
            Value::String(name) if !name.is_empty() && name != request.class_name && !name.contains('/') => name,
            other => return Err(format!("Invalid instance name: {}", other)),
        };
        if let Some(entry) = lock(&self.instances).get(&instance_id) {
            if entry.class_name != request.class_name {
                return Err(format!("Instance {} already exists with class {}", instance_id, entry.class_name));
            }
            return Ok(Value::String(instance_id));
        }
        let object = self.construct(request, args)?;
        self.insert(&request.class_name, &instance_id, object);
        Ok(Value::String(instance_id))
    }

    fn get_named(&self, request: &CallRequest) -> Result<Value, String> {
        let args = request_args(request);
        let instance_id = args
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| "Missing instance name".to_string())?;
        match lock(&self.instances).get(instance_id) {
            Some(entry) if entry.class_name == request.class_name => Ok(Value::String(instance_id.to_string())),
            _ => Err(format!("Could not find instance: {}", instance_id)),
        }
    }

    fn delete(&self, request: &CallRequest) -> Result<Value, String> {
        let args = request_args(request);
        let instance_id = args
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| "Missing instance id".to_string())?;
        let mut instances = lock(&self.instances);
        let belongs = instances
            .get(instance_id)
            .is_some_and(|entry| entry.class_name == request.class_name);
        if belongs {
            instances.remove(instance_id);
        }
        Ok(Value::Bool(belongs))
    }

    fn insert(&self, class_name: &str, instance_id: &str, object: Object) {
        debug!("Created instance {} of class {}", instance_id, class_name);
        lock(&self.instances).insert(
            instance_id.to_string(),
            InstanceEntry {
                class_name: class_name.to_string(),
                object: Arc::new(Mutex::new(object)),
            },
        );
    }

    fn call_static(&self, request: &CallRequest) -> Result<Value, String> {
        let args = request_args(request);
        let function = {
            let classes = self.classes.read().map_err(|e| e.to_string())?;
            let entry = classes
                .get(&request.class_name)
                .ok_or_else(|| format!("Could not find class: {}", request.class_name))?;
            resolve(&entry.statics, &request.method, &args)
                .cloned()
                .ok_or_else(|| format!("Could not find function: {}", request.method))?
        };
        function(&self.invocation(request, args))
    }

    fn call_member(&self, request: &CallRequest) -> Result<Value, String> {
        let (class_name, object) = {
            let instances = lock(&self.instances);
            let entry = instances
                .get(&request.target_id)
                .ok_or_else(|| format!("Could not find instance: {}", request.target_id))?;
            (entry.class_name.clone(), entry.object.clone())
        };
        if !request.class_name.is_empty() && request.class_name != class_name {
            return Err(format!("Instance {} is not of class {}", request.target_id, request.class_name));
        }
        let args = request_args(request);
        let function = {
            let classes = self.classes.read().map_err(|e| e.to_string())?;
            let entry = classes
                .get(&class_name)
                .ok_or_else(|| format!("Could not find class: {}", class_name))?;
            resolve(&entry.members, &request.method, &args)
                .cloned()
                .ok_or_else(|| format!("Could not find function: {}", request.method))?
        };
        let invocation = self.invocation(request, args);
        // Dropped after the instance lock, so handlers may call back into it
        let _held = CallbackSink::hold();
        let mut object = lock(&object);
        function(&mut object, &invocation)
    }
}

impl Adapter for ClassRegistry {
    fn call(&self, request: CallRequest) -> Result<Value, String> {
        match request.method.as_str() {
            CREATE => self.create(&request),
            CREATE_NAMED => self.create_named(&request),
            GET_NAMED => self.get_named(&request),
            DELETE => self.delete(&request),
            _ if request.is_static() => self.call_static(&request),
            _ => self.call_member(&request),
        }
    }

    fn classes(&self) -> Vec<String> {
        self.classes
            .read()
            .map(|classes| classes.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn member_functions(&self, class_name: &str) -> Vec<String> {
        self.classes
            .read()
            .ok()
            .and_then(|classes| {
                classes
                    .get(class_name)
                    .map(|entry| entry.members.iter().map(|(name, _)| name.clone()).collect())
            })
            .unwrap_or_default()
    }

    fn static_functions(&self, class_name: &str) -> Vec<String> {
        let Ok(classes) = self.classes.read() else {
            return Vec::new();
        };
        let Some(entry) = classes.get(class_name) else {
            return Vec::new();
        };
        [CREATE, CREATE_NAMED, GET_NAMED, DELETE]
            .iter()
            .map(|s| s.to_string())
            .chain(entry.statics.iter().map(|(name, _)| name.clone()))
            .collect()
    }

    fn on_callback(&self, handler: CallbackHandler) {
        self.sink.add(handler);
    }
}
