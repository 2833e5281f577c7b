//! Zone resolution for requested hostnames

use super::client::Zone;

/// Whether `hostname` is `zone` itself or lies under it
pub fn hostname_in_zone(hostname: &str, zone: &str) -> bool {
    let hostname = normalize(hostname);
    let zone = normalize(zone);
    !zone.is_empty()
        && (hostname == zone || hostname.ends_with(&format!(".{}", zone)))
}

/// Most specific zone containing `hostname`
///
/// `sub.shop.example.com` against zones `example.com` and `shop.example.com`
/// resolves to `shop.example.com`.
pub fn find_zone_for_hostname<'a>(hostname: &str, zones: &'a [Zone]) -> Option<&'a Zone> {
    zones
        .iter()
        .filter(|zone| hostname_in_zone(hostname, &zone.name))
        .max_by_key(|zone| normalize(&zone.name).len())
}

/// Most specific domain name containing `hostname`
pub fn find_domain_for_hostname<'a>(hostname: &str, domains: &'a [String]) -> Option<&'a String> {
    domains
        .iter()
        .filter(|domain| hostname_in_zone(hostname, domain))
        .max_by_key(|domain| normalize(domain).len())
}

fn normalize(name: &str) -> String {
    name.trim().trim_end_matches('.').to_lowercase()
}
