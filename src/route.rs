//! Longest-prefix-match route table, loaded from the `[routeN]` sections of
//! the settings file.

use crate::settings::Settings;
use std::net::Ipv4Addr;

#[derive(Debug, Clone)]
struct Route {
    prefix: Ipv4Addr,
    mask_len: u8,
    next_hop: String,
}

pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new() -> Self {
        RouteTable { routes: Vec::new() }
    }

    pub fn add_route(&mut self, destination: Ipv4Addr, mask_len: u8, next_hop: impl Into<String>) {
        self.routes.push(Route {
            prefix: destination,
            mask_len,
            next_hop: next_hop.into(),
        });
        // Longest mask first so the first scanned match is the longest.
        self.routes.sort_by(|a, b| b.mask_len.cmp(&a.mask_len));
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let mut table = RouteTable::new();
        let route_count: u32 = settings.get("config.route_count", 0);
        for i in 0..route_count {
            let destination: Option<Ipv4Addr> =
                settings.get_opt(&format!("route{i}.destination"));
            let mask: Option<Ipv4Addr> = settings.get_opt(&format!("route{i}.mask"));
            let next_hop: Option<String> = settings.get_opt(&format!("route{i}.nexthop"));

            let (Some(destination), Some(mask), Some(next_hop)) = (destination, mask, next_hop)
            else {
                tracing::warn!("skipping malformed route{i} entry");
                continue;
            };
            table.add_route(destination, mask_len_from_netmask(mask), next_hop);
        }
        table
    }

    /// Returns the next hop for the longest matching prefix, or an empty
    /// string when no route (default or otherwise) matches.
    pub fn longest_prefix_match(&self, dst: Ipv4Addr) -> String {
        let dst_bits = u32::from(dst);
        for route in &self.routes {
            let mask = mask_for_len(route.mask_len);
            if u32::from(route.prefix) & mask == dst_bits & mask {
                return route.next_hop.clone();
            }
        }
        String::new()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

fn mask_for_len(len: u8) -> u32 {
    if len == 0 {
        0
    } else {
        u32::MAX << (32 - len as u32)
    }
}

fn mask_len_from_netmask(mask: Ipv4Addr) -> u8 {
    u32::from(mask).count_ones() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins_over_shorter_overlapping_route() {
        let mut table = RouteTable::new();
        table.add_route(Ipv4Addr::new(10, 0, 0, 0), 8, "10.0.0.1");
        table.add_route(Ipv4Addr::new(10, 1, 0, 0), 16, "10.1.0.1");

        assert_eq!(
            table.longest_prefix_match(Ipv4Addr::new(10, 1, 2, 3)),
            "10.1.0.1"
        );
        assert_eq!(
            table.longest_prefix_match(Ipv4Addr::new(10, 2, 2, 3)),
            "10.0.0.1"
        );
    }

    #[test]
    fn unmatched_destination_returns_empty_next_hop() {
        let mut table = RouteTable::new();
        table.add_route(Ipv4Addr::new(10, 0, 0, 0), 8, "10.0.0.1");
        assert_eq!(
            table.longest_prefix_match(Ipv4Addr::new(192, 168, 1, 1)),
            ""
        );
    }

    #[test]
    fn default_route_matches_everything() {
        let mut table = RouteTable::new();
        table.add_route(Ipv4Addr::new(0, 0, 0, 0), 0, "default-hop");
        assert_eq!(
            table.longest_prefix_match(Ipv4Addr::new(8, 8, 8, 8)),
            "default-hop"
        );
    }
}
