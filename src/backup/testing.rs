// In-memory collaborators recording the order of every call they receive.
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;

use super::service::ServiceController;
use super::store::{ObjectStore, UploadBody};
use super::types::RemoteObjectRef;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    List { bucket: String, prefix: String },
    Put { bucket: String, key: String },
    Delete { bucket: String, key: String },
    Stop(String),
    Start(String),
}

#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    fn push(&self, call: Call) {
        self.0.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }
}

fn configured(slot: &Mutex<Option<String>>) -> Option<String> {
    slot.lock().unwrap().clone()
}

pub fn remote(key: &str, secs: i64) -> RemoteObjectRef {
    RemoteObjectRef {
        key: key.to_string(),
        last_modified: DateTime::<Utc>::from_timestamp(secs, 0).unwrap(),
    }
}

#[derive(Debug, Default)]
pub struct FakeStore {
    log: CallLog,
    objects: Mutex<Vec<RemoteObjectRef>>,
    uploads: Mutex<HashMap<String, Vec<u8>>>,
    list_error: Mutex<Option<String>>,
    put_error: Mutex<Option<String>>,
    delete_error: Mutex<Option<String>>,
    stall_put: Mutex<bool>,
}

impl FakeStore {
    pub fn new(log: CallLog) -> Self {
        FakeStore { log, ..Default::default() }
    }

    pub fn with_objects(objects: Vec<RemoteObjectRef>) -> Self {
        let store = FakeStore::default();
        *store.objects.lock().unwrap() = objects;
        store
    }

    pub fn insert(&self, object: RemoteObjectRef) {
        self.objects.lock().unwrap().push(object);
    }

    pub fn fail_list(&self, message: &str) {
        *self.list_error.lock().unwrap() = Some(message.to_string());
    }

    /// Fails the put as soon as it is called, without draining the body.
    pub fn fail_put(&self, message: &str) {
        *self.put_error.lock().unwrap() = Some(message.to_string());
    }

    /// Makes the put hang without reading, so the pipeline backs up behind it.
    pub fn stall_put(&self) {
        *self.stall_put.lock().unwrap() = true;
    }

    pub fn fail_delete(&self, message: &str) {
        *self.delete_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.log.calls()
    }

    pub fn uploaded(&self, key: &str) -> Option<Vec<u8>> {
        self.uploads.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().iter().map(|o| o.key.clone()).collect()
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<RemoteObjectRef>> {
        self.log.push(Call::List { bucket: bucket.into(), prefix: prefix.into() });
        if let Some(message) = configured(&self.list_error) {
            anyhow::bail!(message);
        }
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|o| o.key.starts_with(prefix))
            .cloned()
            .collect())
    }

    /// Only a fully received stream counts as a put; a body that errors
    /// part-way leaves nothing behind, like an aborted multipart upload.
    async fn put_object_stream(&self, bucket: &str, key: &str, mut body: UploadBody) -> Result<()> {
        if let Some(message) = configured(&self.put_error) {
            anyhow::bail!(message);
        }
        let stalled = *self.stall_put.lock().unwrap();
        if stalled {
            return std::future::pending().await;
        }
        let mut data = Vec::new();
        body.read_to_end(&mut data).await?;

        self.log.push(Call::Put { bucket: bucket.into(), key: key.into() });
        self.uploads.lock().unwrap().insert(key.to_string(), data);
        self.insert(RemoteObjectRef { key: key.to_string(), last_modified: Utc::now() });
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.log.push(Call::Delete { bucket: bucket.into(), key: key.into() });
        if let Some(message) = configured(&self.delete_error) {
            anyhow::bail!(message);
        }
        self.objects.lock().unwrap().retain(|o| o.key != key);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeService {
    log: CallLog,
    stop_error: Mutex<Option<String>>,
    start_error: Mutex<Option<String>>,
    stall_stop: Mutex<bool>,
}

impl FakeService {
    pub fn new(log: CallLog) -> Self {
        FakeService { log, ..Default::default() }
    }

    pub fn fail_stop(&self, message: &str) {
        *self.stop_error.lock().unwrap() = Some(message.to_string());
    }

    /// Makes the stop hang once it has been recorded.
    pub fn stall_stop(&self) {
        *self.stall_stop.lock().unwrap() = true;
    }

    pub fn fail_start(&self, message: &str) {
        *self.start_error.lock().unwrap() = Some(message.to_string());
    }
}

#[async_trait]
impl ServiceController for FakeService {
    async fn stop(&self, service: &str) -> Result<()> {
        self.log.push(Call::Stop(service.to_string()));
        let stalled = *self.stall_stop.lock().unwrap();
        if stalled {
            return std::future::pending().await;
        }
        match configured(&self.stop_error) {
            Some(message) => anyhow::bail!(message),
            None => Ok(()),
        }
    }

    async fn start(&self, service: &str) -> Result<()> {
        self.log.push(Call::Start(service.to_string()));
        match configured(&self.start_error) {
            Some(message) => anyhow::bail!(message),
            None => Ok(()),
        }
    }
}
