//! gce_router_peer: one BGP peer on a Cloud Router
//!
//! Peers are not first-class API objects; they live inside the parent
//! router's `bgp_peers` list and can only be written by patching that list
//! wholesale. Every mutation is a read-router, edit-list, patch-router cycle
//! executed under the keyed lock for the parent router, so concurrent
//! operations on sibling peers cannot lose each other's updates.
//!
//! MD5 authentication adds a wrinkle: the peer entry names its key, but the
//! key material lives in the router's `md5_authentication_keys` list, and a
//! key must be referenced by exactly one peer. Create, update, and delete
//! keep the two lists consistent in a single patch.

use std::collections::HashMap;
use std::time::Duration;

use vela_core::provider::{ProviderError, ProviderResult};
use vela_core::resource::{Resource, ResourceId, State, Value};

use crate::GceProvider;
use crate::api::operation::wait_for_operation;
use crate::api::types::{
    Router, RouterAdvertisedIpRange, RouterBgpPeer, RouterMd5AuthenticationKey, RouterPatch,
};
use crate::config::{Md5KeyConfig, RouterPeerConfig};

const ROUTER_TIMEOUT: Duration = Duration::from_secs(10 * 60);

pub(crate) fn router_peer_identifier(
    project: &str,
    region: &str,
    router: &str,
    name: &str,
) -> String {
    format!("projects/{}/regions/{}/routers/{}/{}", project, region, router, name)
}

pub(crate) fn parse_router_peer_identifier(
    identifier: &str,
) -> ProviderResult<(String, String, String, String)> {
    let parts: Vec<&str> = identifier.split('/').collect();
    match parts.as_slice() {
        ["projects", project, "regions", region, "routers", router, name]
            if !project.is_empty()
                && !region.is_empty()
                && !router.is_empty()
                && !name.is_empty() =>
        {
            Ok((
                project.to_string(),
                region.to_string(),
                router.to_string(),
                name.to_string(),
            ))
        }
        _ => Err(ProviderError::invalid_input(
            "identifier",
            format!("malformed router peer identifier {:?}", identifier),
        )),
    }
}

impl GceProvider {
    pub(crate) async fn create_router_peer(&self, resource: &Resource) -> ProviderResult<State> {
        let config = RouterPeerConfig::from_resource(resource)?;
        let project = self.project.clone();
        let region = config.region.clone().unwrap_or_else(|| self.region.clone());

        let _guard = self
            .locks
            .lock(&format!("router/{}/{}", region, config.router))
            .await;
        log::debug!("creating peer {} on router {}", config.name, config.router);

        let router = self.fetch_router(&project, &region, &config.router).await?;
        if find_peer(&router.bgp_peers, &config.name).is_some() {
            return Err(ProviderError::conflict(
                format!("router peer {}", config.name),
                "a peer with this name already exists on the router",
            ));
        }

        let mut peers = router.bgp_peers.clone();
        let mut peer = expand_peer(&config);
        let mut patch = RouterPatch::default();
        if let Some(md5) = &config.md5_authentication_key {
            peer.md5_authentication_key_name = Some(md5.name.clone());
            let mut keys = router.md5_authentication_keys.clone();
            keys.push(RouterMd5AuthenticationKey {
                name: md5.name.clone(),
                key: Some(md5.key.clone()),
            });
            patch.md5_authentication_keys = Some(keys);
        }
        peers.push(peer);
        patch.bgp_peers = Some(peers);

        let op = self
            .api
            .patch_router(&project, &region, &config.router, &patch)
            .await
            .map_err(|e| ProviderError::remote("Creating Router Peer", e))?;
        wait_for_operation(
            self.api.as_ref(),
            &project,
            op,
            "Creating Router Peer",
            ROUTER_TIMEOUT,
        )
        .await?;

        self.router_peer_state(
            resource.id.clone(),
            &project,
            &region,
            &config.router,
            &config.name,
            config.md5_authentication_key.as_ref(),
        )
        .await
    }

    pub(crate) async fn read_router_peer(
        &self,
        id: &ResourceId,
        identifier: Option<&str>,
        prior: Option<&State>,
    ) -> ProviderResult<State> {
        let (project, region, router_name, peer_name) = match identifier {
            Some(identifier) => parse_router_peer_identifier(identifier)?,
            None => {
                let region = prior
                    .and_then(|state| state.get_str("region"))
                    .unwrap_or(&self.region)
                    .to_string();
                let router_name = prior
                    .and_then(|state| state.get_str("router"))
                    .ok_or_else(|| {
                        ProviderError::invalid_input(
                            "router",
                            "cannot look up a router peer without its parent router",
                        )
                    })?
                    .to_string();
                (self.project.clone(), region, router_name, id.name.clone())
            }
        };
        let md5 = prior.and_then(|state| prior_md5_key(&state.attributes));
        self.router_peer_state(
            id.clone(),
            &project,
            &region,
            &router_name,
            &peer_name,
            md5.as_ref(),
        )
        .await
    }

    pub(crate) async fn update_router_peer(
        &self,
        id: &ResourceId,
        identifier: &str,
        to: &Resource,
    ) -> ProviderResult<State> {
        let (project, region, router_name, peer_name) = parse_router_peer_identifier(identifier)?;
        let config = RouterPeerConfig::from_resource(to)?;

        let _guard = self
            .locks
            .lock(&format!("router/{}/{}", region, router_name))
            .await;

        let router = self.fetch_router(&project, &region, &router_name).await?;
        let Some(index) = router.bgp_peers.iter().position(|peer| peer.name == peer_name) else {
            return Err(ProviderError::not_found(format!("router peer {}", peer_name)));
        };

        let live = &router.bgp_peers[index];
        let mut peers = router.bgp_peers.clone();
        let mut keys = router.md5_authentication_keys.clone();
        let mut merged = merge_peer(live, &config);
        match &config.md5_authentication_key {
            Some(md5) => {
                // A renamed key leaves its predecessor unreferenced, which
                // the service rejects; drop it in the same patch
                if let Some(previous) = &live.md5_authentication_key_name
                    && previous != &md5.name
                {
                    keys.retain(|key| key.name != *previous);
                }
                merged.md5_authentication_key_name = Some(md5.name.clone());
                match keys.iter_mut().find(|key| key.name == md5.name) {
                    Some(entry) => entry.key = Some(md5.key.clone()),
                    None => keys.push(RouterMd5AuthenticationKey {
                        name: md5.name.clone(),
                        key: Some(md5.key.clone()),
                    }),
                }
            }
            None => {
                if let Some(dropped) = live.md5_authentication_key_name.clone() {
                    merged.md5_authentication_key_name = None;
                    keys.retain(|key| key.name != dropped);
                }
            }
        }
        peers[index] = merged;

        let patch = RouterPatch {
            bgp_peers: Some(peers),
            md5_authentication_keys: Some(keys),
        };
        let op = self
            .api
            .patch_router(&project, &region, &router_name, &patch)
            .await
            .map_err(|e| ProviderError::remote("Updating Router Peer", e))?;
        wait_for_operation(
            self.api.as_ref(),
            &project,
            op,
            "Updating Router Peer",
            ROUTER_TIMEOUT,
        )
        .await?;

        self.router_peer_state(
            id.clone(),
            &project,
            &region,
            &router_name,
            &peer_name,
            config.md5_authentication_key.as_ref(),
        )
        .await
    }

    pub(crate) async fn delete_router_peer(
        &self,
        id: &ResourceId,
        identifier: &str,
    ) -> ProviderResult<()> {
        let (project, region, router_name, peer_name) = parse_router_peer_identifier(identifier)?;

        let _guard = self
            .locks
            .lock(&format!("router/{}/{}", region, router_name))
            .await;

        let router = match self.api.get_router(&project, &region, &router_name).await {
            Ok(router) => router,
            Err(e) if e.is_not_found() => {
                log::debug!("router {} already gone", router_name);
                return Ok(());
            }
            Err(e) => return Err(ProviderError::remote("reading router", e)),
        };
        let Some(index) = router.bgp_peers.iter().position(|peer| peer.name == peer_name) else {
            log::debug!("peer {} already gone from router {}", id.name, router_name);
            return Ok(());
        };

        let mut peers = router.bgp_peers.clone();
        let removed = peers.remove(index);
        let mut keys = router.md5_authentication_keys.clone();
        if let Some(key_name) = &removed.md5_authentication_key_name {
            keys.retain(|key| key.name != *key_name);
        }

        let patch = RouterPatch {
            bgp_peers: Some(peers),
            md5_authentication_keys: Some(keys),
        };
        let op = self
            .api
            .patch_router(&project, &region, &router_name, &patch)
            .await
            .map_err(|e| ProviderError::remote("Deleting Router Peer", e))?;
        wait_for_operation(
            self.api.as_ref(),
            &project,
            op,
            "Deleting Router Peer",
            ROUTER_TIMEOUT,
        )
        .await
    }

    async fn fetch_router(
        &self,
        project: &str,
        region: &str,
        name: &str,
    ) -> ProviderResult<Router> {
        match self.api.get_router(project, region, name).await {
            Ok(router) => Ok(router),
            Err(e) if e.is_not_found() => {
                Err(ProviderError::not_found(format!("router {}", name)))
            }
            Err(e) => Err(ProviderError::remote("reading router", e)),
        }
    }

    /// Re-read the parent router and flatten this peer's entry, or an absent
    /// state when the router or the peer is gone
    async fn router_peer_state(
        &self,
        id: ResourceId,
        project: &str,
        region: &str,
        router_name: &str,
        peer_name: &str,
        md5: Option<&Md5KeyConfig>,
    ) -> ProviderResult<State> {
        let router = match self.api.get_router(project, region, router_name).await {
            Ok(router) => router,
            Err(e) if e.is_not_found() => return Ok(State::not_found(id)),
            Err(e) => return Err(ProviderError::remote("reading router", e)),
        };
        let Some(peer) = find_peer(&router.bgp_peers, peer_name) else {
            return Ok(State::not_found(id));
        };
        let identifier = router_peer_identifier(project, region, router_name, peer_name);
        Ok(State::existing(id, flatten_peer(peer, router_name, region, md5))
            .with_identifier(identifier))
    }
}

fn find_peer<'a>(peers: &'a [RouterBgpPeer], name: &str) -> Option<&'a RouterBgpPeer> {
    peers.iter().find(|peer| peer.name == name)
}

fn expand_peer(config: &RouterPeerConfig) -> RouterBgpPeer {
    RouterBgpPeer {
        name: config.name.clone(),
        interface_name: Some(config.interface_name.clone()),
        ip_address: None,
        peer_ip_address: config.peer_ip_address.clone(),
        peer_asn: Some(config.peer_asn),
        advertised_route_priority: config.advertised_route_priority,
        advertise_mode: Some(config.advertise_mode.clone()),
        advertised_groups: config.advertised_groups.clone(),
        advertised_ip_ranges: config
            .advertised_ip_ranges
            .iter()
            .map(|range| RouterAdvertisedIpRange {
                range: range.range.clone(),
                description: range.description.clone(),
            })
            .collect(),
        enable: Some(if config.enable { "TRUE" } else { "FALSE" }.to_string()),
        md5_authentication_key_name: None,
        management_type: None,
    }
}

/// The service owns `ip_address` and `management_type`; a patched entry keeps
/// whatever the live peer carries for those, and inherits fields the desired
/// configuration leaves unset
fn merge_peer(live: &RouterBgpPeer, config: &RouterPeerConfig) -> RouterBgpPeer {
    let mut merged = expand_peer(config);
    merged.ip_address = live.ip_address.clone();
    merged.management_type = live.management_type.clone();
    merged.md5_authentication_key_name = live.md5_authentication_key_name.clone();
    if merged.peer_ip_address.is_none() {
        merged.peer_ip_address = live.peer_ip_address.clone();
    }
    if merged.advertised_route_priority.is_none() {
        merged.advertised_route_priority = live.advertised_route_priority;
    }
    merged
}

fn flatten_peer(
    peer: &RouterBgpPeer,
    router: &str,
    region: &str,
    md5: Option<&Md5KeyConfig>,
) -> HashMap<String, Value> {
    let mut attrs = HashMap::new();
    attrs.insert("name".to_string(), Value::from(peer.name.clone()));
    attrs.insert("router".to_string(), Value::from(router));
    attrs.insert("region".to_string(), Value::from(region));
    if let Some(interface) = &peer.interface_name {
        attrs.insert("interface".to_string(), Value::from(interface.clone()));
    }
    if let Some(address) = &peer.ip_address {
        attrs.insert("ip_address".to_string(), Value::from(address.clone()));
    }
    if let Some(address) = &peer.peer_ip_address {
        attrs.insert("peer_ip_address".to_string(), Value::from(address.clone()));
    }
    if let Some(asn) = peer.peer_asn {
        attrs.insert("peer_asn".to_string(), Value::from(asn));
    }
    if let Some(priority) = peer.advertised_route_priority {
        attrs.insert("advertised_route_priority".to_string(), Value::from(priority));
    }
    attrs.insert(
        "advertise_mode".to_string(),
        Value::from(
            peer.advertise_mode
                .clone()
                .unwrap_or_else(|| "DEFAULT".to_string()),
        ),
    );
    if !peer.advertised_groups.is_empty() {
        attrs.insert(
            "advertised_groups".to_string(),
            Value::List(
                peer.advertised_groups
                    .iter()
                    .map(|group| Value::from(group.clone()))
                    .collect(),
            ),
        );
    }
    if !peer.advertised_ip_ranges.is_empty() {
        let ranges = peer
            .advertised_ip_ranges
            .iter()
            .map(|range| {
                let mut block = HashMap::new();
                block.insert("range".to_string(), Value::from(range.range.clone()));
                if let Some(description) = &range.description {
                    block.insert("description".to_string(), Value::from(description.clone()));
                }
                block
            })
            .collect();
        attrs.insert("advertised_ip_ranges".to_string(), Value::blocks(ranges));
    }
    // Absent reads as enabled
    attrs.insert(
        "enable".to_string(),
        Value::from(peer.enable.as_deref() != Some("FALSE")),
    );
    if let Some(management) = &peer.management_type {
        attrs.insert("management_type".to_string(), Value::from(management.clone()));
    }
    if let Some(key_name) = &peer.md5_authentication_key_name {
        let mut block = HashMap::new();
        block.insert("name".to_string(), Value::from(key_name.clone()));
        // Write-only; the value only survives by carrying it forward
        block.insert(
            "key".to_string(),
            Value::from(md5.map(|key| key.key.clone()).unwrap_or_default()),
        );
        attrs.insert("md5_authentication_key".to_string(), Value::blocks(vec![block]));
    }
    attrs
}

/// The carried-forward key value from the last recorded state
fn prior_md5_key(attrs: &HashMap<String, Value>) -> Option<Md5KeyConfig> {
    let blocks = attrs.get("md5_authentication_key")?.as_list()?;
    let block = blocks.first()?.as_map()?;
    Some(Md5KeyConfig {
        name: block.get("name")?.as_str()?.to_string(),
        key: block.get("key")?.as_str()?.to_string(),
    })
}
