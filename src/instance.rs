//! Proxy instance lifecycle
use crate::ca::{CertificateManager, CertificateSource};
use crate::errors::{Error, Result};
use crate::plan::{FingerprintEngine, PlanSource};
use crate::profile::FingerprintProfile;
use crate::server::{ProxyServer, ServerOptions};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, OnceCell};
use tokio::task::JoinHandle;

const DEFAULT_CA_STORAGE: &str = "./.hazetunnel";

fn default_bind_address() -> String {
  "127.0.0.1".to_string()
}

fn default_bind_port() -> u16 {
  8080
}

/// Settings for one proxy instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyInstanceConfig {
  /// Registry key
  pub id: String,
  /// Address to listen on
  #[serde(default = "default_bind_address")]
  pub bind_address: String,
  /// Port to listen on, `0` for any free port
  #[serde(default = "default_bind_port")]
  pub bind_port: u16,
  /// Script injected into HTML responses; empty disables injection
  #[serde(default)]
  pub payload: String,
  /// `http://`, `socks5://` or `socks5h://` URL of an upstream proxy
  #[serde(default)]
  pub upstream_proxy: Option<String>,
  /// Log pipeline events at `info`
  #[serde(default)]
  pub verbose: bool,
}

impl ProxyInstanceConfig {
  /// Config for `id` with default values.
  pub fn new(id: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      bind_address: default_bind_address(),
      bind_port: default_bind_port(),
      payload: String::new(),
      upstream_proxy: None,
      verbose: false,
    }
  }

  /// Set the listen address.
  pub fn bind_address(mut self, value: impl Into<String>) -> Self {
    self.bind_address = value.into();
    self
  }

  /// Set the listen port.
  pub fn bind_port(mut self, value: u16) -> Self {
    self.bind_port = value;
    self
  }

  /// Set the injected payload.
  pub fn payload(mut self, value: impl Into<String>) -> Self {
    self.payload = value.into();
    self
  }

  /// Route outbound traffic through an upstream proxy.
  pub fn upstream_proxy(mut self, value: impl Into<String>) -> Self {
    self.upstream_proxy = Some(value.into());
    self
  }

  /// Log pipeline events at `info`.
  pub fn verbose(mut self, value: bool) -> Self {
    self.verbose = value;
    self
  }
}

/// A started instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
  /// Registry key
  pub id: String,
  /// Address the listener is bound to
  pub local_addr: SocketAddr,
}

struct RunningInstance {
  shutdown: watch::Sender<bool>,
  task: JoinHandle<Result<()>>,
  local_addr: SocketAddr,
}

/// Owns running proxy instances, keyed by id.
///
/// The lock only guards the map; binding and shutting down happen outside
/// it.
pub struct InstanceRegistry {
  instances: Mutex<HashMap<String, RunningInstance>>,
  certs: OnceCell<Arc<dyn CertificateSource>>,
  ca_storage: PathBuf,
  plans: Arc<dyn PlanSource>,
  options: ServerOptions,
}

impl Default for InstanceRegistry {
  fn default() -> Self {
    Self::new()
  }
}

impl InstanceRegistry {
  /// Registry storing its CA under `./.hazetunnel`.
  pub fn new() -> Self {
    Self {
      instances: Mutex::new(HashMap::new()),
      certs: OnceCell::new(),
      ca_storage: PathBuf::from(DEFAULT_CA_STORAGE),
      plans: Arc::new(FingerprintEngine::new(FingerprintProfile::default())),
      options: ServerOptions::default(),
    }
  }

  /// Load or generate the CA under `path` on first start.
  pub fn with_ca_storage(mut self, path: impl AsRef<Path>) -> Self {
    self.ca_storage = path.as_ref().to_path_buf();
    self
  }

  /// Use `certs` instead of a CA from disk.
  pub fn with_certificate_source(self, certs: Arc<dyn CertificateSource>) -> Self {
    Self {
      certs: OnceCell::new_with(Some(certs)),
      ..self
    }
  }

  /// Draw outbound handshake plans from `plans`.
  pub fn with_plan_source(mut self, plans: Arc<dyn PlanSource>) -> Self {
    self.plans = plans;
    self
  }

  /// Tunables applied to instances started afterwards.
  pub fn with_options(mut self, options: ServerOptions) -> Self {
    self.options = options;
    self
  }

  /// Where the CA is stored when loaded from disk.
  pub fn ca_storage(&self) -> &Path {
    &self.ca_storage
  }

  async fn certificate_source(&self) -> Result<Arc<dyn CertificateSource>> {
    self
      .certs
      .get_or_try_init(|| async {
        let manager = CertificateManager::new(&self.ca_storage).await?;
        Ok::<_, Error>(Arc::new(manager) as Arc<dyn CertificateSource>)
      })
      .await
      .cloned()
  }

  /// Bind and start serving `config`.
  ///
  /// Fails with [`Error::DuplicateInstance`] if the id is taken and with
  /// [`Error::Bind`] if the address is unavailable.
  pub async fn start(&self, config: ProxyInstanceConfig) -> Result<InstanceHandle> {
    if self.instances.lock().await.contains_key(&config.id) {
      return Err(Error::duplicate_instance(&config.id));
    }
    let certs = self.certificate_source().await?;
    let server = ProxyServer::new(&config, certs, self.plans.clone(), self.options.clone());
    let listener = server.bind().await?;
    let local_addr = listener.local_addr()?;

    let mut instances = self.instances.lock().await;
    if instances.contains_key(&config.id) {
      return Err(Error::duplicate_instance(&config.id));
    }
    let (shutdown, rx) = watch::channel(false);
    let id = config.id.clone();
    let task_id = id.clone();
    let task = tokio::spawn(async move {
      let result = server.serve(listener, rx).await;
      if let Err(e) = &result {
        tracing::error!("instance {} stopped: {}", task_id, e);
      }
      result
    });
    instances.insert(
      id.clone(),
      RunningInstance {
        shutdown,
        task,
        local_addr,
      },
    );
    drop(instances);

    if config.verbose || config.id == "cli" {
      tracing::info!("Hazetunnel listening at {}", local_addr);
    } else {
      tracing::debug!("Hazetunnel listening at {}", local_addr);
    }
    Ok(InstanceHandle { id, local_addr })
  }

  /// Stop the instance `id` and wait until its listener is closed and its
  /// connections are drained.
  pub async fn stop(&self, id: &str) -> Result<()> {
    let instance = self
      .instances
      .lock()
      .await
      .remove(id)
      .ok_or_else(|| Error::instance_not_found(id))?;
    let _ = instance.shutdown.send(true);
    match instance.task.await {
      Ok(result) => result,
      Err(e) if e.is_cancelled() => Ok(()),
      Err(e) => Err(Error::other(format!("instance {} panicked: {}", id, e))),
    }
  }

  /// Stop every instance.
  pub async fn stop_all(&self) -> Result<()> {
    let mut first_error = None;
    for id in self.ids().await {
      match self.stop(&id).await {
        Ok(()) | Err(Error::InstanceNotFound(_)) => {}
        Err(e) => {
          first_error.get_or_insert(e);
        }
      }
    }
    first_error.map_or(Ok(()), Err)
  }

  /// Whether `id` is registered.
  pub async fn is_running(&self, id: &str) -> bool {
    self.instances.lock().await.contains_key(id)
  }

  /// Registered ids, sorted.
  pub async fn ids(&self) -> Vec<String> {
    let mut ids: Vec<String> = self.instances.lock().await.keys().cloned().collect();
    ids.sort();
    ids
  }

  /// Listen address of `id`.
  pub async fn local_addr(&self, id: &str) -> Option<SocketAddr> {
    self.instances.lock().await.get(id).map(|i| i.local_addr)
  }
}
