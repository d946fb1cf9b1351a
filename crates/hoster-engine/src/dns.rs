//! Parallel DNS resolution against public resolvers.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::proto::rr::RecordType;
use tracing::debug;

use hoster_core::{Error, Result};

const PER_RESOLVER_TIMEOUT: Duration = Duration::from_secs(3);
const OVERALL_TIMEOUT: Duration = Duration::from_secs(5);

/// What a hostname resolves to, as far as verification cares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedRecords {
    pub a: Vec<Ipv4Addr>,
    /// Canonical name target, if the host is a CNAME.
    pub cname: Option<String>,
}

#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn resolve(&self, hostname: &str) -> Result<ResolvedRecords>;
}

/// Fans the lookup out to a fixed set of public resolvers concurrently and
/// takes the first success, cancelling the rest. Total failure preserves
/// each resolver's error.
pub struct PublicDnsResolver {
    resolvers: Vec<IpAddr>,
}

impl PublicDnsResolver {
    pub fn new(resolvers: Vec<IpAddr>) -> Self {
        Self { resolvers }
    }

    fn resolver_for(ip: IpAddr) -> TokioAsyncResolver {
        let mut config = ResolverConfig::new();
        config.add_name_server(NameServerConfig::new(
            SocketAddr::new(ip, 53),
            Protocol::Udp,
        ));
        let mut opts = ResolverOpts::default();
        opts.timeout = PER_RESOLVER_TIMEOUT;
        opts.attempts = 1;
        TokioAsyncResolver::tokio(config, opts)
    }

    async fn lookup_via(ip: IpAddr, hostname: String) -> Result<ResolvedRecords, String> {
        let resolver = Self::resolver_for(ip);

        // A and CNAME queried together; NXDOMAIN on one record type is not a
        // failure of the whole lookup.
        let (a_result, cname_result) = tokio::join!(
            resolver.ipv4_lookup(hostname.clone()),
            resolver.lookup(hostname.clone(), RecordType::CNAME),
        );

        let a: Vec<Ipv4Addr> = match a_result {
            Ok(lookup) => lookup.iter().map(|r| r.0).collect(),
            Err(_) => Vec::new(),
        };
        let cname = match cname_result {
            Ok(lookup) => lookup
                .record_iter()
                .filter_map(|r| r.data())
                .filter_map(|d| d.as_cname())
                .map(|c| c.0.to_utf8())
                .next(),
            Err(_) => None,
        };

        if a.is_empty() && cname.is_none() {
            return Err(format!("{ip}: no A or CNAME records"));
        }
        debug!(%ip, %hostname, a = a.len(), cname = cname.is_some(), "resolved");
        Ok(ResolvedRecords { a, cname })
    }
}

#[async_trait]
impl DnsResolver for PublicDnsResolver {
    async fn resolve(&self, hostname: &str) -> Result<ResolvedRecords> {
        if self.resolvers.is_empty() {
            return Err(Error::internal(std::io::Error::other(
                "no resolvers configured",
            )));
        }

        use futures::StreamExt;
        use futures::stream::FuturesUnordered;

        let mut lookups: FuturesUnordered<_> = self
            .resolvers
            .iter()
            .map(|ip| Self::lookup_via(*ip, hostname.to_string()))
            .collect();

        // First success wins; dropping the set cancels the stragglers. On
        // total failure every resolver's complaint survives in the message.
        let mut failures = Vec::with_capacity(self.resolvers.len());
        let race = async {
            while let Some(result) = lookups.next().await {
                match result {
                    Ok(records) => return Some(records),
                    Err(failure) => failures.push(failure),
                }
            }
            None
        };
        match tokio::time::timeout(OVERALL_TIMEOUT, race).await {
            Ok(Some(records)) => Ok(records),
            Ok(None) => Err(Error::unavailable(
                format!("dns lookup for {hostname}"),
                std::io::Error::other(failures.join("; ")),
            )),
            Err(_) => Err(Error::unavailable(
                format!("dns lookup for {hostname}"),
                std::io::Error::other("all resolvers timed out"),
            )),
        }
    }
}
