// LxdClient: the fleet API over the LXD REST interface.
// Every mutating call returns an operation which is awaited through
// `/1.0/operations/<id>/wait` before the call returns.

use crate::lxd_events;

use lxdrunner_common::constants::provision::STOP_TIMEOUT_SECS;
use lxdrunner_common::{
    ExecOutput, FleetApi, FleetError, HttpClientFactory, InstanceSource, InstanceSpec,
    LifecycleEvent, RemoteConfig,
};

use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use url::Url;

/// Standard LXD response envelope.
#[derive(Debug, Deserialize)]
struct LxdResponse {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    operation: String,
    #[serde(default)]
    metadata: Value,
}

/// Metadata of a finished operation.
#[derive(Debug, Deserialize)]
struct OperationMetadata {
    #[serde(default)]
    status: String,
    #[serde(default)]
    err: String,
    #[serde(default)]
    metadata: Value,
}

pub struct LxdClient {
    http: Client,
    base: Url,
    remote: RemoteConfig,
}

impl LxdClient {
    /// Connect to the HTTPS endpoint of `remote`.
    pub fn new(remote: &RemoteConfig) -> anyhow::Result<Self> {
        let addr = remote
            .addr
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("fleet remote has no address"))?;
        let base = Url::parse(addr)?;
        if base.scheme() != "https" {
            anyhow::bail!("fleet remote must be an https:// address, got {}", addr);
        }
        Ok(Self {
            http: HttpClientFactory::create_fleet_client(remote)?,
            base,
            remote: remote.clone(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, FleetError> {
        self.base
            .join(path)
            .map_err(|e| FleetError::Decode(format!("bad path {}: {}", path, e)))
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, FleetError> {
        Ok(self.http.request(method, self.url(path)?))
    }

    /// Send a request and decode the envelope. 404 becomes `NotFound`.
    async fn send(&self, request: RequestBuilder, what: &str) -> Result<LxdResponse, FleetError> {
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        let body: Option<LxdResponse> = serde_json::from_str(&text).ok();

        if status == StatusCode::NOT_FOUND {
            return Err(FleetError::NotFound(what.to_string()));
        }
        if !status.is_success() {
            let message = body
                .map(|b| b.error)
                .filter(|e| !e.is_empty())
                .unwrap_or(text);
            return Err(FleetError::Api {
                status: status.as_u16(),
                message: format!("{}: {}", what, message.trim()),
            });
        }
        body.ok_or_else(|| FleetError::Decode(format!("{}: not an LXD response", what)))
    }

    /// Wait for the operation started by `response`, if any, and return the
    /// operation's own metadata.
    async fn wait(&self, response: LxdResponse, what: &str) -> Result<Value, FleetError> {
        if response.kind != "async" {
            return Ok(response.metadata);
        }
        let path = format!("{}/wait", response.operation);
        let done = self.send(self.request(Method::GET, &path)?, what).await?;
        let op: OperationMetadata = serde_json::from_value(done.metadata)
            .map_err(|e| FleetError::Decode(format!("{}: {}", what, e)))?;
        if op.status != "Success" {
            return Err(FleetError::Operation {
                operation: what.to_string(),
                message: if op.err.is_empty() { op.status } else { op.err },
            });
        }
        Ok(op.metadata)
    }

    async fn call(&self, request: RequestBuilder, what: &str) -> Result<Value, FleetError> {
        let response = self.send(request, what).await?;
        self.wait(response, what).await
    }

    async fn set_state(&self, name: &str, body: Value, what: &str) -> Result<(), FleetError> {
        let request = self
            .request(Method::PUT, &format!("/1.0/instances/{}/state", name))?
            .json(&body);
        self.call(request, what).await?;
        Ok(())
    }

    /// Fetch a recorded exec log. A missing log reads as empty.
    async fn fetch_log(&self, path: Option<&str>) -> Result<String, FleetError> {
        let Some(path) = path else {
            return Ok(String::new());
        };
        let response = self.request(Method::GET, path)?.send().await?;
        if !response.status().is_success() {
            return Ok(String::new());
        }
        Ok(response.text().await?)
    }

    async fn file_request(
        &self,
        name: &str,
        path: &str,
        kind: &str,
        mode: u32,
        body: Vec<u8>,
    ) -> Result<(), FleetError> {
        let mut url = self.url(&format!("/1.0/instances/{}/files", name))?;
        url.query_pairs_mut().append_pair("path", path);
        let request = self
            .http
            .post(url)
            .header("X-LXD-type", kind)
            .header("X-LXD-mode", format!("{:04o}", mode))
            .header("X-LXD-uid", "0")
            .header("X-LXD-gid", "0")
            .header("X-LXD-write", "overwrite")
            .body(body);
        self.call(request, &format!("{} {} in {}", kind, path, name))
            .await?;
        Ok(())
    }
}

/// Request body creating `spec`.
fn create_body(spec: &InstanceSpec) -> Value {
    let source = match &spec.source {
        InstanceSource::Local { alias } => json!({
            "type": "image",
            "alias": alias,
        }),
        InstanceSource::Remote {
            alias,
            server,
            protocol,
        } => json!({
            "type": "image",
            "mode": "pull",
            "alias": alias,
            "server": server,
            "protocol": protocol,
        }),
    };
    json!({
        "name": spec.name,
        "ephemeral": spec.ephemeral,
        "profiles": spec.profiles,
        "source": source,
        "type": spec.instance_type.as_str(),
    })
}

/// Instance names from the `/1.0/instances` URL list.
fn instance_names(metadata: &Value) -> Vec<String> {
    metadata
        .as_array()
        .map(|urls| {
            urls.iter()
                .filter_map(Value::as_str)
                .filter_map(|u| u.split('?').next())
                .filter_map(|u| u.rsplit('/').next())
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Exit code and recorded log paths from a finished exec operation.
fn exec_result(metadata: &Value) -> Result<(i32, Option<String>, Option<String>), FleetError> {
    let code = metadata
        .get("return")
        .and_then(Value::as_i64)
        .ok_or_else(|| FleetError::Decode("exec result has no return code".into()))?;
    let log = |fd: &str| {
        metadata
            .get("output")
            .and_then(|o| o.get(fd))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    Ok((code as i32, log("1"), log("2")))
}

#[async_trait]
impl FleetApi for LxdClient {
    async fn image_alias_exists(&self, alias: &str) -> Result<bool, FleetError> {
        let request = self.request(Method::GET, &format!("/1.0/images/aliases/{}", alias))?;
        match self.send(request, &format!("image alias {}", alias)).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn profile_exists(&self, profile: &str) -> Result<bool, FleetError> {
        let request = self.request(Method::GET, &format!("/1.0/profiles/{}", profile))?;
        match self.send(request, &format!("profile {}", profile)).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list_instances(&self) -> Result<Vec<String>, FleetError> {
        let response = self
            .send(self.request(Method::GET, "/1.0/instances")?, "list instances")
            .await?;
        Ok(instance_names(&response.metadata))
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<(), FleetError> {
        let request = self
            .request(Method::POST, "/1.0/instances")?
            .json(&create_body(spec));
        self.call(request, &format!("create {}", spec.name)).await?;
        Ok(())
    }

    async fn start_instance(&self, name: &str) -> Result<(), FleetError> {
        self.set_state(
            name,
            json!({ "action": "start", "timeout": -1 }),
            &format!("start {}", name),
        )
        .await
    }

    async fn stop_instance(&self, name: &str, force: bool) -> Result<(), FleetError> {
        self.set_state(
            name,
            json!({ "action": "stop", "force": force, "timeout": STOP_TIMEOUT_SECS }),
            &format!("stop {}", name),
        )
        .await
    }

    async fn delete_instance(&self, name: &str) -> Result<(), FleetError> {
        let request = self.request(Method::DELETE, &format!("/1.0/instances/{}", name))?;
        self.call(request, &format!("delete {}", name)).await?;
        Ok(())
    }

    async fn mkdir(&self, name: &str, path: &str, mode: u32) -> Result<(), FleetError> {
        self.file_request(name, path, "directory", mode, Vec::new())
            .await
    }

    async fn push_file(
        &self,
        name: &str,
        path: &str,
        contents: Vec<u8>,
        mode: u32,
    ) -> Result<(), FleetError> {
        self.file_request(name, path, "file", mode, contents).await
    }

    async fn execute(
        &self,
        name: &str,
        command: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<ExecOutput, FleetError> {
        let body = json!({
            "command": command,
            "environment": env,
            "wait-for-websocket": false,
            "record-output": true,
            "interactive": false,
        });
        let request = self
            .request(Method::POST, &format!("/1.0/instances/{}/exec", name))?
            .json(&body);
        let metadata = self
            .call(request, &format!("exec {} in {}", command.join(" "), name))
            .await?;
        let (exit_code, stdout, stderr) = exec_result(&metadata)?;
        Ok(ExecOutput {
            exit_code,
            stdout: self.fetch_log(stdout.as_deref()).await?,
            stderr: self.fetch_log(stderr.as_deref()).await?,
        })
    }

    async fn subscribe_lifecycle_events(
        &self,
    ) -> Result<BoxStream<'static, Result<LifecycleEvent, FleetError>>, FleetError> {
        lxd_events::subscribe(&self.base, &self.remote).await
    }
}
