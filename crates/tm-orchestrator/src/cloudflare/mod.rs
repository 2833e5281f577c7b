//! Cloudflare REST API access

mod client;
mod zones;

pub use client::{
    AccountDetails, ApiError, CloudflareClient, DnsRecord, DnsRecordRequest, RemoteTunnel,
    TokenStatus, Zone,
};
pub use zones::{find_domain_for_hostname, find_zone_for_hostname, hostname_in_zone};
