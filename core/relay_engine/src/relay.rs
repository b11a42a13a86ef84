//! Wires the enabled components to the source dispatch

use std::sync::Arc;

use crate::config::RelayConfig;
use crate::dispatch::Dispatch;
use crate::error::ConfigError;
use crate::metrics::{self, StreamStats};
use crate::services::{Context, StatusIndicator};
use crate::socket_client::{SocketClient, SocketClientOptions};
use crate::socket_server::{SocketServer, SocketServerOptions};
use crate::uplink::{Uplink, UplinkOptions, UplinkSlot};

/// Optional status indicators, one per component that drives one
#[derive(Clone, Default)]
pub struct Indicators {
    pub ntrip_server: Option<Arc<dyn StatusIndicator>>,
    pub ntrip_server_2: Option<Arc<dyn StatusIndicator>>,
    pub socket_client: Option<Arc<dyn StatusIndicator>>,
}

/// Running set of components
pub struct Relay {
    uplinks: Vec<Arc<Uplink>>,
    server: Option<Arc<SocketServer>>,
    client: Option<Arc<SocketClient>>,
}

impl Relay {
    /// Start every component the configuration enables and subscribe it to
    /// `dispatch`. A component that fails to start is logged and left out.
    pub fn start(ctx: Context, dispatch: &Dispatch, indicators: Indicators) -> Result<Self, ConfigError> {
        let config = ctx.config.load()?;
        let mut relay = Relay {
            uplinks: Vec::new(),
            server: None,
            client: None,
        };

        for slot in [UplinkSlot::Primary, UplinkSlot::Secondary] {
            let section = slot.config(&config);
            if !section.active {
                continue;
            }
            let indicator = match slot {
                _ if section.color == 0 => None,
                UplinkSlot::Primary => indicators.ntrip_server.clone(),
                UplinkSlot::Secondary => indicators.ntrip_server_2.clone(),
            };

            let uplink = Uplink::new(slot, ctx.clone(), indicator, UplinkOptions::from_config(&config));
            match uplink.start() {
                Ok(()) => {
                    dispatch.subscribe(uplink.clone());
                    relay.uplinks.push(uplink);
                }
                Err(e) => log::error!("[{}] Failed to start uplink: {}", slot.tag(), e),
            }
        }

        relay.server = start_server(&ctx, &config, dispatch);
        relay.client = start_client(&ctx, &config, dispatch, indicators.socket_client);

        log::info!(
            "Relay started: {} uplink(s), socket server {}, socket client {}",
            relay.uplinks.len(),
            if relay.server.is_some() { "on" } else { "off" },
            if relay.client.is_some() { "on" } else { "off" },
        );
        Ok(relay)
    }

    pub fn uplinks(&self) -> &[Arc<Uplink>] {
        &self.uplinks
    }

    pub fn uplink(&self, slot: UplinkSlot) -> Option<&Arc<Uplink>> {
        self.uplinks.iter().find(|u| u.slot() == slot)
    }

    pub fn socket_server(&self) -> Option<&Arc<SocketServer>> {
        self.server.as_ref()
    }

    pub fn socket_client(&self) -> Option<&Arc<SocketClient>> {
        self.client.as_ref()
    }

    /// Prometheus text for every running component
    pub fn render_metrics(&self) -> String {
        let mut stats: Vec<&StreamStats> = self.uplinks.iter().map(|u| u.stats()).collect();
        if let Some(server) = &self.server {
            stats.push(server.stats());
        }
        if let Some(client) = &self.client {
            stats.push(client.stats());
        }

        let mut out = metrics::render(&stats);
        if let Some(server) = &self.server {
            out.push_str("# HELP ntrip_relay_socket_server_peers Connected socket server peers\n");
            out.push_str("# TYPE ntrip_relay_socket_server_peers gauge\n");
            out.push_str(&format!("ntrip_relay_socket_server_peers {}\n", server.peer_count()));
        }
        out
    }

    /// Stop every component, then wait for all of their threads
    pub fn shutdown(self) {
        log::info!("Shutting down relay");
        for uplink in &self.uplinks {
            uplink.stop();
        }
        if let Some(server) = &self.server {
            server.stop();
        }
        if let Some(client) = &self.client {
            client.stop();
        }

        for uplink in &self.uplinks {
            uplink.join();
        }
        if let Some(server) = &self.server {
            server.join();
        }
        if let Some(client) = &self.client {
            client.join();
        }
    }
}

fn start_server(ctx: &Context, config: &RelayConfig, dispatch: &Dispatch) -> Option<Arc<SocketServer>> {
    if !config.socket_server.active {
        return None;
    }
    let server = SocketServerOptions::from_config(&config.socket_server)
        .and_then(|options| SocketServer::start(ctx, options));
    match server {
        Ok(server) => {
            dispatch.subscribe(server.clone());
            Some(server)
        }
        Err(e) => {
            log::error!("Failed to start socket server: {}", e);
            None
        }
    }
}

fn start_client(
    ctx: &Context,
    config: &RelayConfig,
    dispatch: &Dispatch,
    indicator: Option<Arc<dyn StatusIndicator>>,
) -> Option<Arc<SocketClient>> {
    if !config.socket_client.active {
        return None;
    }
    let client = match SocketClient::new(ctx.clone(), indicator, SocketClientOptions::default()) {
        Ok(client) => client,
        Err(e) => {
            log::warn!("Socket client not started: {}", e);
            return None;
        }
    };
    match client.start() {
        Ok(()) => {
            dispatch.subscribe(client.clone());
            Some(client)
        }
        Err(e) => {
            log::error!("Failed to start socket client: {}", e);
            None
        }
    }
}
