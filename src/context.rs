use crate::errors::Result;
use crate::proxy::UpstreamProxy;
use std::sync::Arc;

/// Values an instance attaches to every request it admits.
///
/// A context is cloned from the instance template when the request line is
/// read and is only read afterwards, so every later stage sees the payload
/// and upstream of the instance that accepted the connection.
#[derive(Debug, Clone)]
pub struct RequestContext {
  instance_id: Arc<str>,
  payload: Arc<str>,
  upstream_proxy: Option<Arc<str>>,
  verbose: bool,
}

impl RequestContext {
  /// Template context for an instance.
  pub fn new(
    instance_id: impl Into<Arc<str>>,
    payload: impl Into<Arc<str>>,
    upstream_proxy: Option<impl Into<Arc<str>>>,
    verbose: bool,
  ) -> Self {
    Self {
      instance_id: instance_id.into(),
      payload: payload.into(),
      upstream_proxy: upstream_proxy.map(Into::into),
      verbose,
    }
  }

  /// Context for one admitted request.
  pub(crate) fn admit(&self) -> RequestContext {
    self.clone()
  }

  /// Id of the owning instance.
  pub fn instance_id(&self) -> &str {
    &self.instance_id
  }

  /// Script body injected into eligible responses.
  pub fn payload(&self) -> &str {
    &self.payload
  }

  /// The configured upstream, as written.
  pub fn upstream_proxy_url(&self) -> Option<&str> {
    self.upstream_proxy.as_deref()
  }

  /// Parse the configured upstream. An unparsable value is an error for
  /// this request only.
  pub fn upstream_proxy(&self) -> Result<Option<UpstreamProxy>> {
    match &self.upstream_proxy {
      None => Ok(None),
      Some(url) => UpstreamProxy::parse(url),
    }
  }

  /// Whether pipeline events log at `info` rather than `debug`.
  pub fn verbose(&self) -> bool {
    self.verbose || &*self.instance_id == "cli"
  }
}
