//! Public IP resolution capability

use std::net::IpAddr;

use async_trait::async_trait;

use crate::error::P2pResult;

/// Resolves this node's addresses as seen from outside
#[async_trait]
pub trait IpResolver: Send + Sync {
    /// The public IP other peers should dial
    async fn public_ip(&self) -> P2pResult<IpAddr>;

    /// The local outbound IP
    async fn outbound_ip(&self) -> P2pResult<IpAddr>;
}

/// Fixed-answer resolver for tests and single-host wiring
pub struct StaticIpResolver {
    public: IpAddr,
    outbound: IpAddr,
}

impl StaticIpResolver {
    pub fn new(public: IpAddr, outbound: IpAddr) -> Self {
        Self { public, outbound }
    }

    /// Resolver that answers with loopback for both questions
    pub fn loopback() -> Self {
        let localhost: IpAddr = IpAddr::from([127, 0, 0, 1]);
        Self::new(localhost, localhost)
    }
}

#[async_trait]
impl IpResolver for StaticIpResolver {
    async fn public_ip(&self) -> P2pResult<IpAddr> {
        Ok(self.public)
    }

    async fn outbound_ip(&self) -> P2pResult<IpAddr> {
        Ok(self.outbound)
    }
}
