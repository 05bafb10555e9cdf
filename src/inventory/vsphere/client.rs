//! vSphere SOAP client
//!
//! A thin vim25 client over reqwest: service content retrieval, session
//! login/logout (cookie based), the property collector calls the collector
//! needs, and the few VM tasks used during migration.

use super::filter;
use super::xml::{self, escape, Element};
use crate::connector::{ca_cert, http_client, insecure_skip_verify, secret_field, SECRET_PASSWORD, SECRET_USER};
use crate::domain::ports::{
    ChangeOp, ObjectUpdate, PropertyChange, SessionFactory, SourceControl, SourceSession, UpdateAction,
    UpdateSet,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const SOAP_ACTION: &str = "urn:vim25/7.0";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const TASK_POLL_INTERVAL: Duration = Duration::from_secs(1);
const TASK_TIMEOUT: Duration = Duration::from_secs(600);

// =============================================================================
// Configuration
// =============================================================================

/// Login material taken from the provider secret
#[derive(Clone, Default)]
pub struct Credentials {
    pub user: String,
    pub password: String,
    pub ca: Option<String>,
    pub insecure: bool,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("insecure", &self.insecure)
            .finish()
    }
}

impl Credentials {
    pub fn from_secret(secret: &Secret) -> Self {
        Self {
            user: secret_field(secret, SECRET_USER).unwrap_or_default(),
            password: secret_field(secret, SECRET_PASSWORD).unwrap_or_default(),
            ca: ca_cert(secret),
            insecure: insecure_skip_verify(secret),
        }
    }
}

/// Managed objects named by the service content
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceContent {
    pub root_folder: String,
    pub property_collector: String,
    pub session_manager: String,
}

// =============================================================================
// Envelope and faults
// =============================================================================

fn envelope(body: &str) -> String {
    format!(
        concat!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>",
            "<soapenv:Envelope xmlns:soapenv=\"http://schemas.xmlsoap.org/soap/envelope/\" ",
            "xmlns:xsd=\"http://www.w3.org/2001/XMLSchema\" ",
            "xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\">",
            "<soapenv:Body>{}</soapenv:Body></soapenv:Envelope>"
        ),
        body
    )
}

fn this(kind: &str, id: &str) -> String {
    format!("<_this type=\"{}\">{}</_this>", kind, escape(id))
}

/// Map a SOAP fault to an error.
fn fault(root: &Element, status: u16) -> Option<Error> {
    let fault = root.descendant("Fault")?;
    let message = fault.child_text("faultstring").unwrap_or("SOAP fault").to_string();
    let detail = fault
        .child("detail")
        .and_then(|d| d.children.first())
        .map(|d| format!("{} {}", d.name, d.xsi_type.as_deref().unwrap_or("")))
        .unwrap_or_default();

    if detail.contains("RequestCanceled") {
        return Some(Error::Canceled);
    }
    let code = if detail.contains("InvalidLogin") || detail.contains("NotAuthenticated") {
        401
    } else if detail.contains("NoPermission") {
        403
    } else if detail.contains("ManagedObjectNotFound") {
        404
    } else if status >= 400 {
        status
    } else {
        500
    };
    Some(Error::SourceApi { code, message })
}

/// Parse a `WaitForUpdatesEx` return value.
pub fn parse_update_set(ret: &Element) -> UpdateSet {
    let mut set = UpdateSet {
        version: ret.child_text("version").unwrap_or_default().to_string(),
        truncated: ret.child_text("truncated") == Some("true"),
        updates: Vec::new(),
    };
    for filter_set in ret.children_named("filterSet") {
        for object_set in filter_set.children_named("objectSet") {
            let action = match object_set.child_text("kind") {
                Some("enter") => UpdateAction::Enter,
                Some("leave") => UpdateAction::Leave,
                _ => UpdateAction::Modify,
            };
            let Some((kind, id)) = object_set.child("obj").and_then(Element::mor) else {
                continue;
            };
            let changes = object_set
                .children_named("changeSet")
                .map(|cs| PropertyChange {
                    name: cs.child_text("name").unwrap_or_default().to_string(),
                    op: match cs.child_text("op") {
                        Some("add") => ChangeOp::Add,
                        Some("remove") => ChangeOp::Remove,
                        Some("indirectRemove") => ChangeOp::IndirectRemove,
                        _ => ChangeOp::Assign,
                    },
                    value: cs.child("val").map(Element::to_value).unwrap_or(Value::Null),
                })
                .collect();
            set.updates.push(ObjectUpdate {
                kind: kind.to_string(),
                id: id.to_string(),
                action,
                changes,
            });
        }
    }
    set
}

// =============================================================================
// Client
// =============================================================================

/// A logged-in vim25 session
pub struct VimClient {
    http: reqwest::Client,
    url: String,
    content: ServiceContent,
    collector: Mutex<Option<String>>,
}

impl std::fmt::Debug for VimClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VimClient").field("url", &self.url).finish()
    }
}

impl VimClient {
    /// Retrieve the service content and log in.
    pub async fn connect(url: &str, credentials: &Credentials) -> Result<Self> {
        let http = http_client(credentials.ca.as_deref(), credentials.insecure, None)?;
        let mut client = Self {
            http,
            url: url.to_string(),
            content: ServiceContent::default(),
            collector: Mutex::new(None),
        };

        let ret = client
            .invoke(&format!(
                "<RetrieveServiceContent xmlns=\"urn:vim25\">{}</RetrieveServiceContent>",
                this("ServiceInstance", "ServiceInstance")
            ), REQUEST_TIMEOUT)
            .await?;
        let ret = ret
            .child("returnval")
            .ok_or_else(|| Error::Internal("service content missing".into()))?;
        client.content = ServiceContent {
            root_folder: ret.child_text("rootFolder").unwrap_or_default().to_string(),
            property_collector: ret.child_text("propertyCollector").unwrap_or_default().to_string(),
            session_manager: ret.child_text("sessionManager").unwrap_or_default().to_string(),
        };

        client
            .invoke(&format!(
                "<Login xmlns=\"urn:vim25\">{}<userName>{}</userName><password>{}</password></Login>",
                this("SessionManager", &client.content.session_manager),
                escape(&credentials.user),
                escape(&credentials.password)
            ), REQUEST_TIMEOUT)
            .await?;
        info!(url = %url, user = %credentials.user, "vSphere session established");
        Ok(client)
    }

    pub fn content(&self) -> &ServiceContent {
        &self.content
    }

    /// POST a request body and return the response element.
    async fn invoke(&self, body: &str, timeout: Duration) -> Result<Element> {
        let resp = self
            .http
            .post(&self.url)
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", SOAP_ACTION)
            .timeout(timeout)
            .body(envelope(body))
            .send()
            .await?;
        let status = resp.status().as_u16();
        let text = resp.text().await?;

        let root = match xml::parse(&text) {
            Ok(root) => root,
            Err(_) if status >= 400 => {
                return Err(Error::SourceApi {
                    code: status,
                    message: text.chars().take(512).collect(),
                })
            }
            Err(e) => return Err(e),
        };
        if let Some(err) = fault(&root, status) {
            return Err(err);
        }
        if status >= 400 {
            return Err(Error::SourceApi {
                code: status,
                message: format!("HTTP {}", status),
            });
        }
        root.descendant("Body")
            .and_then(|b| b.children.first())
            .cloned()
            .ok_or_else(|| Error::Internal("empty SOAP body".into()))
    }

    fn collector(&self) -> Result<String> {
        self.collector
            .lock()
            .clone()
            .ok_or_else(|| Error::Internal("property filter not created".into()))
    }

    /// Read properties of one object.
    pub async fn retrieve(&self, kind: &str, id: &str, paths: &[&str]) -> Result<Map<String, Value>> {
        let path_set: String = paths.iter().map(|p| format!("<pathSet>{}</pathSet>", p)).collect();
        let body = format!(
            concat!(
                "<RetrievePropertiesEx xmlns=\"urn:vim25\">{}<specSet>",
                "<propSet><type>{}</type>{}</propSet>",
                "<objectSet><obj type=\"{}\">{}</obj><skip>false</skip></objectSet>",
                "</specSet><options/></RetrievePropertiesEx>"
            ),
            this("PropertyCollector", &self.content.property_collector),
            kind,
            path_set,
            kind,
            escape(id)
        );
        let resp = self.invoke(&body, REQUEST_TIMEOUT).await?;
        let mut out = Map::new();
        if let Some(objects) = resp.child("returnval").and_then(|r| r.child("objects")) {
            for prop in objects.children_named("propSet") {
                if let (Some(name), Some(val)) = (prop.child_text("name"), prop.child("val")) {
                    out.insert(name.to_string(), val.to_value());
                }
            }
        }
        Ok(out)
    }

    /// Invoke a `*_Task` method and wait for its result.
    async fn run_task(&self, body: &str) -> Result<Value> {
        let resp = self.invoke(body, REQUEST_TIMEOUT).await?;
        let task = resp
            .child("returnval")
            .map(|r| r.text.clone())
            .ok_or_else(|| Error::Internal("task reference missing".into()))?;

        let deadline = tokio::time::Instant::now() + TASK_TIMEOUT;
        loop {
            let info = self
                .retrieve("Task", &task, &["info.state", "info.result", "info.error.localizedMessage"])
                .await?;
            match info.get("info.state").and_then(Value::as_str) {
                Some("success") => return Ok(info.get("info.result").cloned().unwrap_or(Value::Null)),
                Some("error") => {
                    return Err(Error::SourceApi {
                        code: 500,
                        message: info
                            .get("info.error.localizedMessage")
                            .and_then(Value::as_str)
                            .unwrap_or("task failed")
                            .to_string(),
                    })
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!("task {}", task)));
            }
            tokio::time::sleep(TASK_POLL_INTERVAL).await;
        }
    }

    pub async fn logout(&self) -> Result<()> {
        let collector = self.collector.lock().take();
        if let Some(collector) = collector {
            let body = format!(
                "<DestroyPropertyCollector xmlns=\"urn:vim25\">{}</DestroyPropertyCollector>",
                this("PropertyCollector", &collector)
            );
            if let Err(e) = self.invoke(&body, REQUEST_TIMEOUT).await {
                debug!(error = %e, "Failed to destroy property collector");
            }
        }
        let body = format!(
            "<Logout xmlns=\"urn:vim25\">{}</Logout>",
            this("SessionManager", &self.content.session_manager)
        );
        self.invoke(&body, REQUEST_TIMEOUT).await?;
        debug!(url = %self.url, "vSphere session closed");
        Ok(())
    }
}

#[async_trait]
impl SourceSession for VimClient {
    async fn subscribe(&self) -> Result<()> {
        let resp = self
            .invoke(&format!(
                "<CreatePropertyCollector xmlns=\"urn:vim25\">{}</CreatePropertyCollector>",
                this("PropertyCollector", &self.content.property_collector)
            ), REQUEST_TIMEOUT)
            .await?;
        let collector = resp
            .child("returnval")
            .map(|r| r.text.clone())
            .ok_or_else(|| Error::Internal("property collector missing".into()))?;

        let body = format!(
            "<CreateFilter xmlns=\"urn:vim25\">{}{}<partialUpdates>false</partialUpdates></CreateFilter>",
            this("PropertyCollector", &collector),
            filter::filter_spec(&self.content.root_folder)
        );
        self.invoke(&body, REQUEST_TIMEOUT).await?;
        *self.collector.lock() = Some(collector);
        Ok(())
    }

    async fn wait_for_updates(&self, version: &str, max_wait: Duration) -> Result<Option<UpdateSet>> {
        let collector = self.collector()?;
        let body = format!(
            concat!(
                "<WaitForUpdatesEx xmlns=\"urn:vim25\">{}<version>{}</version>",
                "<options><maxWaitSeconds>{}</maxWaitSeconds></options></WaitForUpdatesEx>"
            ),
            this("PropertyCollector", &collector),
            escape(version),
            max_wait.as_secs()
        );
        let resp = self.invoke(&body, max_wait + REQUEST_TIMEOUT).await?;
        Ok(resp.child("returnval").map(parse_update_set))
    }

    async fn cancel_wait(&self) -> Result<()> {
        let collector = self.collector()?;
        let body = format!(
            "<CancelWaitForUpdates xmlns=\"urn:vim25\">{}</CancelWaitForUpdates>",
            this("PropertyCollector", &collector)
        );
        self.invoke(&body, REQUEST_TIMEOUT).await?;
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        VimClient::logout(self).await
    }
}

// =============================================================================
// Factories
// =============================================================================

/// Opens vim25 sessions for the collector
#[derive(Debug, Clone)]
pub struct VimSessionFactory {
    url: String,
    credentials: Credentials,
}

impl VimSessionFactory {
    pub fn new(url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            url: url.into(),
            credentials,
        }
    }
}

#[async_trait]
impl SessionFactory for VimSessionFactory {
    async fn connect(&self) -> Result<Arc<dyn SourceSession>> {
        let client = VimClient::connect(&self.url, &self.credentials).await?;
        Ok(Arc::new(client))
    }
}

/// VM operations over a lazily opened session
pub struct VimSourceControl {
    url: String,
    credentials: Credentials,
    session: tokio::sync::Mutex<Option<Arc<VimClient>>>,
}

impl VimSourceControl {
    pub fn new(url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            url: url.into(),
            credentials,
            session: tokio::sync::Mutex::new(None),
        }
    }

    async fn session(&self) -> Result<Arc<VimClient>> {
        let mut guard = self.session.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let client = Arc::new(VimClient::connect(&self.url, &self.credentials).await?);
        *guard = Some(client.clone());
        Ok(client)
    }

    /// Drop the cached session after an authentication failure.
    async fn invalidate_on_auth(&self, err: &Error) {
        if err.kind() == crate::error::ErrorKind::PermissionDenied {
            *self.session.lock().await = None;
        }
    }
}

#[async_trait]
impl SourceControl for VimSourceControl {
    async fn power_off(&self, vm_id: &str) -> Result<()> {
        let client = self.session().await?;
        let result = async {
            let props = client.retrieve("VirtualMachine", vm_id, &["runtime.powerState"]).await?;
            if props.get("runtime.powerState").and_then(Value::as_str) == Some("poweredOff") {
                return Ok(());
            }
            let body = format!(
                "<PowerOffVM_Task xmlns=\"urn:vim25\">{}</PowerOffVM_Task>",
                this("VirtualMachine", vm_id)
            );
            client.run_task(&body).await.map(|_| ())
        }
        .await;
        if let Err(e) = &result {
            self.invalidate_on_auth(e).await;
        }
        result
    }

    async fn create_snapshot(&self, vm_id: &str) -> Result<String> {
        let client = self.session().await?;
        let body = format!(
            concat!(
                "<CreateSnapshot_Task xmlns=\"urn:vim25\">{}<name>forklift-migration-precopy</name>",
                "<description>Forklift warm migration checkpoint</description>",
                "<memory>false</memory><quiesce>false</quiesce></CreateSnapshot_Task>"
            ),
            this("VirtualMachine", vm_id)
        );
        let result = client.run_task(&body).await;
        match result {
            Ok(value) => value
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::Internal("snapshot reference missing".into())),
            Err(e) => {
                self.invalidate_on_auth(&e).await;
                Err(e)
            }
        }
    }

    async fn remove_snapshot(&self, _vm_id: &str, snapshot_id: &str) -> Result<()> {
        let client = self.session().await?;
        let body = format!(
            concat!(
                "<RemoveSnapshot_Task xmlns=\"urn:vim25\">{}",
                "<removeChildren>false</removeChildren><consolidate>true</consolidate></RemoveSnapshot_Task>"
            ),
            this("VirtualMachineSnapshot", snapshot_id)
        );
        let result = client.run_task(&body).await.map(|_| ());
        if let Err(e) = &result {
            self.invalidate_on_auth(e).await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const UPDATES: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/"
 xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
<soapenv:Body><WaitForUpdatesExResponse xmlns="urn:vim25"><returnval>
<version>1</version>
<filterSet><filter type="PropertyFilter">session[1]1</filter>
<objectSet><kind>enter</kind><obj type="Folder">group-d1</obj>
<changeSet><name>name</name><op>assign</op><val xsi:type="xsd:string">Datacenters</val></changeSet>
<changeSet><name>childEntity</name><op>assign</op><val xsi:type="ArrayOfManagedObjectReference">
<ManagedObjectReference type="Datacenter">datacenter-1</ManagedObjectReference></val></changeSet>
</objectSet>
<objectSet><kind>leave</kind><obj type="VirtualMachine">vm-9</obj></objectSet>
</filterSet>
<truncated>true</truncated>
</returnval></WaitForUpdatesExResponse></soapenv:Body></soapenv:Envelope>"#;

    #[test]
    fn test_parse_update_set() {
        let root = xml::parse(UPDATES).unwrap();
        let ret = root.descendant("returnval").unwrap();
        let set = parse_update_set(ret);
        assert_eq!(set.version, "1");
        assert!(set.truncated);
        assert_eq!(set.updates.len(), 2);

        let folder = &set.updates[0];
        assert_eq!(folder.kind, "Folder");
        assert_eq!(folder.action, UpdateAction::Enter);
        assert_eq!(folder.changes[0].value, "Datacenters");
        assert_eq!(folder.changes[1].value[0]["id"], "datacenter-1");

        assert_eq!(set.updates[1].action, UpdateAction::Leave);
        assert!(set.updates[1].changes.is_empty());
    }

    #[test]
    fn test_fault_mapping() {
        let doc = r#"<soapenv:Envelope xmlns:soapenv="s" xmlns:xsi="x"><soapenv:Body>
<soapenv:Fault><faultcode>ServerFaultCode</faultcode>
<faultstring>Cannot complete login due to an incorrect user name or password.</faultstring>
<detail><InvalidLoginFault xsi:type="InvalidLogin"/></detail></soapenv:Fault>
</soapenv:Body></soapenv:Envelope>"#;
        let root = xml::parse(doc).unwrap();
        assert_matches!(fault(&root, 500), Some(Error::SourceApi { code: 401, .. }));

        let doc = r#"<Envelope><Body><Fault><faultstring>x</faultstring>
<detail><RequestCanceledFault/></detail></Fault></Body></Envelope>"#;
        let root = xml::parse(doc).unwrap();
        assert_matches!(fault(&root, 500), Some(Error::Canceled));

        let root = xml::parse("<Envelope><Body><ok/></Body></Envelope>").unwrap();
        assert!(fault(&root, 200).is_none());
    }
}
