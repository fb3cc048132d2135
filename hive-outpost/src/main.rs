//! Hive Outpost - remote node daemon for the Hive outpost system
//!
//! Single-threaded bus dispatcher for a remote node hosting migrated
//! agents:
//! - Registers itself and its agents with the central server
//! - Routes bus messages to hosted agents, relaying unknown destinations
//!   to central with a bounded replay counter
//! - Executes the scout's control-plane actions (gather, add/rm agent,
//!   clean, launch, stop, users refresh, reload)

mod actions;
mod config;
mod router;

use std::collections::HashMap;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use hive_core::{Envelope, IniFile};

use config::{OutpostConfig, OutpostPaths};
use router::RouteDecision;

struct Outpost {
    id: String,
    config: OutpostConfig,
    paths: OutpostPaths,
    /// Platform agent registry, mirrored to `etc/hive.conf` on change.
    main_conf: IniFile,
    /// Cache of agent bus ports, mutated only from the accept path.
    router: HashMap<String, u16>,
}

impl Outpost {
    async fn new() -> Result<Self> {
        let paths = OutpostPaths::from_env()?;
        let config = OutpostConfig::load(&paths.home).await?;
        let main_conf = IniFile::load(&paths.hive_conf)?;

        let mut outpost = Self {
            id: config.outpost.id.clone(),
            config,
            paths,
            main_conf,
            router: HashMap::new(),
        };

        info!("initialized private data");

        // Register the outpost itself, then every configured agent, so the
        // central server can dispatch through the tunnel
        info!("registering outpost with server...");
        let own_registration = outpost.registration(&outpost.id);
        outpost.send_to_central(&own_registration).await;

        for agent in outpost.main_conf.section_names("agent ") {
            info!("registering agent {agent} with server");
            let registration = outpost.registration(&agent);
            outpost.send_to_central(&registration).await;

            if let Some(port) = outpost
                .main_conf
                .section(&format!("agent {agent}"))
                .and_then(|s| s.get_u16("port"))
            {
                outpost.router.insert(agent, port);
            }
        }

        Ok(outpost)
    }

    /// Registration message for an endpoint reachable through the tunnel.
    fn registration(&self, name: &str) -> Envelope {
        let tunnel = self.config.central.tunnel.to_string();
        Envelope::from_pairs(&[
            ("dst", "server"),
            ("tag", "register"),
            ("name", name),
            ("host", self.config.central.host.as_str()),
            ("port", tunnel.as_str()),
        ])
    }

    async fn send_to_central(&self, msg: &Envelope) {
        let host = self.config.central.host.clone();
        self.send(&host, self.config.central.port, msg).await;
    }

    /// Fire-and-forget delivery over a fresh connection.
    async fn send(&self, host: &str, port: u16, msg: &Envelope) {
        let raw = msg.to_wire();
        match TcpStream::connect((host, port)).await {
            Ok(mut stream) => {
                if let Err(e) = stream.write_all(raw.as_bytes()).await {
                    error!("failed to send message to {host}:{port} -> {raw}: {e}");
                } else {
                    let _ = stream.shutdown().await;
                }
            }
            Err(e) => error!("failed to send message to {host}:{port} -> {raw}: {e}"),
        }
    }

    /// Dispatch one incoming message.
    async fn handle(&mut self, msg: Envelope) {
        let Some(dest) = msg.dst().map(|d| d.to_string()) else {
            error!("message has no destination: {}", msg.to_wire());
            return;
        };

        // Agents started locally register through the outpost
        if dest == "server" && msg.has_tag("register") {
            info!("received register message for server");

            let Some(agent) = msg.get("name").map(|n| n.to_string()) else {
                error!("register message has no agent name");
                return;
            };

            if let Some(port) = msg.get("port").and_then(|p| p.parse().ok()) {
                self.router.insert(agent.clone(), port);
            }

            let registration = self.registration(&agent);
            self.send_to_central(&registration).await;
            return;
        }

        if dest == self.id {
            return self.handle_action(msg).await;
        }

        self.route(&dest, msg).await;
    }

    /// Deliver to a hosted agent or relay to central.
    async fn route(&mut self, dest: &str, msg: Envelope) {
        match router::decide(&self.router, &self.main_conf, dest, &msg) {
            RouteDecision::Deliver { port, learned } => {
                if learned {
                    info!("agent found in configuration, updating router");
                    self.router.insert(dest.to_string(), port);
                } else {
                    info!("agent found in router");
                }

                let host = self.paths.bind_host.clone();
                self.send(&host, port, &msg).await;
            }
            RouteDecision::Relay(relayed) => {
                info!("unknown destination, relaying to central server");
                self.send_to_central(&relayed).await;
            }
            RouteDecision::Discard => {
                info!("maximum replay, discarding message: {}", msg.to_wire());
            }
        }
    }

    /// Orders addressed to the outpost itself.
    async fn handle_action(&mut self, msg: Envelope) {
        let Some(action) = msg.get("action") else {
            error!("no action to perform");
            return;
        };

        match action {
            "gather-agents" => {
                info!("gathering MIPS information for all agents");

                let agents: Vec<String> = self.router.keys().cloned().collect();
                let reply =
                    actions::gather_agents(&self.config, &self.paths, &agents).await;

                info!("sending MIPS information for all agents");
                self.send_to_central(&reply).await;
            }

            "refresh-users" => {
                let Some(blob) = msg.get("users") else {
                    error!("refresh-users message has no users blob");
                    return;
                };
                if let Err(e) = actions::refresh_users(&self.paths, blob) {
                    error!("failed to refresh users list: {e}");
                }
            }

            "add-agent" => {
                let (Some(agent), Some(port)) = (msg.get("agent"), msg.get("port")) else {
                    error!("add-agent message is incomplete");
                    return;
                };

                info!("adding agent {agent} (port {port}) to the list");

                actions::add_agent(&mut self.main_conf, agent, port);
                self.persist_conf();

                if let Ok(port) = port.parse() {
                    self.router.insert(agent.to_string(), port);
                }
            }

            "rm-agent" => {
                let Some(agent) = msg.get("agent").map(|a| a.to_string()) else {
                    error!("rm-agent message has no agent name");
                    return;
                };

                actions::rm_agent(&mut self.main_conf, &self.paths, &agent);
                self.persist_conf();
                self.router.remove(&agent);

                info!("removed agent {agent} from outpost");
            }

            "clean" => {
                info!("removing static files");
                let paths: Vec<&str> = msg.get_all("paths");
                actions::clean_static(&self.paths, &paths);
            }

            "launch" => {
                let Some(agent) = msg.get("agent").map(|a| a.to_string()) else {
                    error!("launch message has no agent name");
                    return;
                };

                if !actions::launch_agent(&self.main_conf, &self.paths, &agent).await {
                    error!("failed to launch agent {agent}");
                    return;
                }

                // Force server register so messages reach the new resident
                let registration = self.registration(&agent);
                self.send_to_central(&registration).await;

                info!("launched agent {agent}");
            }

            "stop" => {
                let Some(agent) = msg.get("agent").map(|a| a.to_string()) else {
                    error!("stop message has no agent name");
                    return;
                };

                if !actions::stop_agent(&self.main_conf, &self.paths, &agent).await {
                    error!("failed to stop agent {agent}");
                    return;
                }

                info!("stopped agent {agent}");
            }

            "reload" => {
                info!("reloading configuration and router");

                match IniFile::load(&self.paths.hive_conf) {
                    Ok(conf) => {
                        self.main_conf = conf;
                        self.router.clear();
                        for agent in self.main_conf.section_names("agent ") {
                            if let Some(port) = self
                                .main_conf
                                .section(&format!("agent {agent}"))
                                .and_then(|s| s.get_u16("port"))
                            {
                                self.router.insert(agent, port);
                            }
                        }
                        info!("reloaded configuration and router");
                    }
                    Err(e) => error!("failed to reload configuration: {e}"),
                }
            }

            "ping" => debug!("received ping"),

            other => error!("unknown action: {other}"),
        }
    }

    fn persist_conf(&self) {
        if let Err(e) = self.main_conf.save(&self.paths.hive_conf) {
            error!("failed to persist platform configuration: {e}");
        }
    }

    /// Single-threaded accept loop: the router is only ever touched here.
    async fn serve(mut self, listener: TcpListener) -> Result<()> {
        loop {
            let (mut sock, addr) = listener.accept().await?;

            let mut buffer = Vec::new();
            if let Err(e) = sock.read_to_end(&mut buffer).await {
                error!("failed to read message from {addr}: {e}");
                continue;
            }

            let raw = String::from_utf8_lossy(&buffer);
            debug!("received: {raw}");

            match Envelope::parse(&raw) {
                Ok(msg) => self.handle(msg).await,
                Err(e) => error!("discarding malformed message from {addr}: {e}"),
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let outpost = Outpost::new().await?;

    let bind_host = outpost.paths.bind_host.clone();
    let bind_port = outpost.paths.bind_port;
    let listener = TcpListener::bind((bind_host.as_str(), bind_port))
        .await
        .with_context(|| format!("cannot bind outpost bus on {bind_host}:{bind_port}"))?;

    info!("initialized socket server");

    outpost.serve(listener).await
}
