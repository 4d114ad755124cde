use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use std::net::IpAddr;

/// Reverse-DNS collaborator used during the greeting phase. Hosts can
/// substitute their own (cache, test fixture, none at all); the server
/// applies its own deadline around the call.
#[async_trait]
pub trait ReverseLookup: Send + Sync + 'static {
    async fn reverse_lookup(&self, ip: IpAddr) -> anyhow::Result<Vec<String>>;
}

/// Default implementation over the system resolver configuration.
pub struct HickoryReverseLookup {
    resolver: TokioAsyncResolver,
}

impl HickoryReverseLookup {
    pub fn from_system_conf() -> anyhow::Result<Self> {
        Ok(Self {
            resolver: TokioAsyncResolver::tokio_from_system_conf()?,
        })
    }
}

#[async_trait]
impl ReverseLookup for HickoryReverseLookup {
    async fn reverse_lookup(&self, ip: IpAddr) -> anyhow::Result<Vec<String>> {
        let names = self
            .resolver
            .reverse_lookup(ip)
            .await?
            .iter()
            .map(|ptr| ptr.0.to_string().trim_end_matches('.').to_string())
            .collect();
        Ok(names)
    }
}

/// Stand-in used when `disable_reverse_lookup` is set.
pub(crate) struct NoReverseLookup;

#[async_trait]
impl ReverseLookup for NoReverseLookup {
    async fn reverse_lookup(&self, _ip: IpAddr) -> anyhow::Result<Vec<String>> {
        Ok(vec![])
    }
}
