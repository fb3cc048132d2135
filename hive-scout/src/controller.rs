/**
 * CONTRÔLEUR SCOUT - Boucles périodiques et commandes opérateur
 *
 * RÔLE : Tient les quatre verrous nommés (agent book, zone book, config,
 * migration), fait tourner les minuteries (refresh, users, gather,
 * balance) et traite les messages du bus : commandes opérateur, cycle de
 * vie des agents en migration et remontées de ressources des outposts.
 *
 * FONCTIONNEMENT : chaque mutation d'un magasin persistant se fait sous
 * son verrou ; les chorégraphies longues passent par le verrou migration.
 * Les boucles tolèrent les erreurs : journalisation puis tick suivant.
 */
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use hive_core::{sampler, serial, Envelope, IniFile};

use crate::balance::{self, AgentSnapshot, OutpostSnapshot};
use crate::book::{now_epoch, AgentBook, ZoneBook};
use crate::bus::{read_message, Bus};
use crate::config::{ConfigStore, OutpostEntry};
use crate::migrate;
use crate::paths::{Paths, CENTRAL};
use crate::transport;
use crate::{messages, rules};

/// Periods of the controller loops, in seconds.
const REFRESH_INFO_PERIOD: u64 = 60;
const REFRESH_USERS_PERIOD: u64 = 60;
const GATHER_PERIOD: u64 = 180;
const BALANCE_PERIOD: u64 = 600;

pub struct Scout {
    pub(crate) paths: Paths,
    pub(crate) bus: Bus,
    pub(crate) agent_book: Mutex<AgentBook>,
    pub(crate) zone_book: Mutex<ZoneBook>,
    pub(crate) config: Mutex<ConfigStore>,
    pub(crate) migration: Mutex<()>,
    starting: AtomicBool,
}

impl Scout {
    pub fn new(
        paths: Paths,
        bus: Bus,
        agent_book: AgentBook,
        zone_book: ZoneBook,
        config: ConfigStore,
    ) -> Arc<Self> {
        Arc::new(Self {
            paths,
            bus,
            agent_book: Mutex::new(agent_book),
            zone_book: Mutex::new(zone_book),
            config: Mutex::new(config),
            migration: Mutex::new(()),
            starting: AtomicBool::new(true),
        })
    }

    // -----------------------------------------------------------------
    // Bootstrap

    /// Open the tunnels and launch every configured outpost, recording the
    /// resulting running state in the zone book.
    pub async fn startup(&self) {
        let entries: Vec<OutpostEntry> = {
            let config = self.config.lock().await;
            config
                .outpost_names()
                .iter()
                .filter_map(|name| config.outpost(name))
                .collect()
        };

        for entry in entries {
            info!("opening tunnel and launching {}", entry.name);

            if !transport::open_tunnel(&self.paths, &entry).await {
                error!("failed to open tunnel to outpost {}", entry.name);
                self.record_running(&entry.name, false).await;
                continue;
            }

            if !transport::launch_outpost(&entry).await {
                error!("failed to launch outpost {}", entry.name);
                self.record_running(&entry.name, false).await;
                continue;
            }

            self.record_running(&entry.name, true).await;
        }
    }

    async fn record_running(&self, outpost: &str, value: bool) {
        let zone = self.zone_book.lock().await;
        if let Err(e) = zone.set_running(outpost, value).await {
            error!("could not record running state of {outpost}: {e}");
        }
    }

    /// Start the four periodic loops.
    pub fn spawn_timers(self: &Arc<Self>) {
        let scout = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(REFRESH_INFO_PERIOD));
            loop {
                timer.tick().await;
                if let Err(e) = scout.refresh_info().await {
                    error!("refresh loop failed: {e}");
                }
            }
        });

        let scout = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(REFRESH_USERS_PERIOD));
            loop {
                timer.tick().await;
                if let Err(e) = scout.refresh_users().await {
                    error!("users loop failed: {e}");
                }
            }
        });

        let scout = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(GATHER_PERIOD));
            loop {
                timer.tick().await;
                if let Err(e) = scout.gather_agent_info().await {
                    error!("gather loop failed: {e}");
                }
            }
        });

        let scout = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(BALANCE_PERIOD));
            loop {
                timer.tick().await;
                if let Err(e) = scout.balance_agents().await {
                    error!("balance loop failed: {e}");
                }
            }
        });
    }

    // -----------------------------------------------------------------
    // Periodic loops

    /// Reconcile the scout configuration and the zone book with the rules
    /// directory and the outpost list.
    pub async fn refresh_info(&self) -> Result<()> {
        let agent_list = self.paths.rules_agents()?;

        info!("refreshing scout configuration");

        let outpost_names = {
            let mut config = self.config.lock().await;
            config.refresh_agents(&agent_list)?;
            // Pick up operator edits of the outpost list
            config.reload_outposts()?;
            config.outpost_names()
        };

        info!("refreshing zone book information");

        let zone = self.zone_book.lock().await;
        zone.refresh_agents(&agent_list).await?;
        zone.refresh_outposts(&outpost_names).await?;

        Ok(())
    }

    /// Ship the current users file to every running outpost.
    pub async fn refresh_users(&self) -> Result<()> {
        info!("sending updated users list to outposts");

        let users = tokio::fs::read_to_string(&self.paths.users_conf)
            .await
            .context("cannot read users file")?;
        let blob = serial::serialize_str(&users);

        for outpost in self.running_outposts().await? {
            self.send(&messages::refresh_users(&outpost, &blob)).await;
        }

        Ok(())
    }

    /// Collect MIPS samples: ask every running outpost to gather its own
    /// agents, then profile the agents hosted on central exactly once.
    pub async fn gather_agent_info(&self) -> Result<()> {
        info!("sending agent gathering messages");

        for outpost in self.running_outposts().await? {
            self.send(&messages::outpost_gather_agents(&outpost)).await;
        }

        info!("gathering agents in central");

        let perf_path = {
            let config = self.config.lock().await;
            config.general().perf_path
        };
        let agents = {
            let zone = self.zone_book.lock().await;
            zone.agent_names_in(CENTRAL).await?
        };

        let gathered = sampler::gather_agent_mips(&agents, &perf_path, &self.paths.var).await;
        self.store_gathered(&gathered).await;

        Ok(())
    }

    /// Compute the target placement and run the resulting migrations. The
    /// first tick is skipped so resource gathering can populate the books.
    pub async fn balance_agents(&self) -> Result<()> {
        if self.starting.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        info!("starting agent balancing");

        let (balance_name, entries, general, free) = {
            let config = self.config.lock().await;
            let entries: Vec<OutpostEntry> = config
                .outpost_names()
                .iter()
                .filter_map(|name| config.outpost(name))
                .collect();
            let general = config.general();
            (general.balance.clone(), entries, general, config.free_list())
        };

        let Some(balance_name) = balance_name else {
            info!("load balancing not enabled");
            return Ok(());
        };
        let Some(algorithm) = balance::algorithm(&balance_name) else {
            error!("unknown algorithm \"{balance_name}\"");
            return Ok(());
        };
        info!("using algorithm: \"{balance_name}\"");

        // Balance on a snapshot: the decided plan is executed even if the
        // books move underneath
        let mut snapshot: Vec<OutpostSnapshot> = Vec::new();
        {
            let zone = self.zone_book.lock().await;

            for entry in &entries {
                if zone.is_running(&entry.name).await? != Some(true) {
                    warn!("outpost {} is not running", entry.name);
                    continue;
                }

                let agents = zone.agents_in(&entry.name).await?;
                snapshot.push(OutpostSnapshot {
                    name: entry.name.clone(),
                    mips: entry.mips,
                    priority: entry.priority,
                    agents: agents
                        .iter()
                        .map(|a| AgentSnapshot {
                            name: a.name.clone(),
                            location: a.location.clone(),
                            mips: a.mips,
                            is_free: free.contains(&a.name),
                        })
                        .collect(),
                });
            }

            let agents = zone.agents_in(CENTRAL).await?;
            snapshot.push(OutpostSnapshot {
                name: CENTRAL.to_string(),
                mips: general.mips,
                priority: general.priority,
                agents: agents
                    .iter()
                    .map(|a| AgentSnapshot {
                        name: a.name.clone(),
                        location: a.location.clone(),
                        mips: a.mips,
                        is_free: free.contains(&a.name),
                    })
                    .collect(),
            });
        }

        info!("executing balancing algorithm");
        let balanced = algorithm(&snapshot);
        debug!("balance result: {balanced:?}");

        let mut migrations: Vec<(String, String)> = Vec::new();
        for (outpost, new_agents) in &balanced {
            info!("checking migrations to outpost \"{outpost}\"");

            let current: Vec<&str> = snapshot
                .iter()
                .find(|o| &o.name == outpost)
                .map(|o| o.agents.iter().map(|a| a.name.as_str()).collect())
                .unwrap_or_default();

            for agent in new_agents {
                if !current.contains(&agent.as_str()) {
                    debug!("registering migration of \"{agent}\" to {outpost}");
                    migrations.push((outpost.clone(), agent.clone()));
                }
            }
        }

        info!("starting agent migrations...");
        for (outpost, agent) in migrations {
            match migrate::run(self, &agent, &outpost).await {
                Ok(msg) => info!("{msg}"),
                Err(msg) => error!("{msg}"),
            }
        }

        Ok(())
    }

    async fn running_outposts(&self) -> Result<Vec<String>> {
        let names = {
            let config = self.config.lock().await;
            config.outpost_names()
        };

        let zone = self.zone_book.lock().await;
        let mut running = Vec::new();
        for name in names {
            if zone.is_running(&name).await? == Some(true) {
                running.push(name);
            } else {
                warn!("outpost {name} is not running");
            }
        }
        Ok(running)
    }

    // -----------------------------------------------------------------
    // Bus dispatch

    /// Route an incoming bus message to its handler.
    pub async fn handle(&self, msg: Envelope) {
        let tags: Vec<String> = msg.tags().iter().map(|t| t.to_string()).collect();

        for tag in &tags {
            match tag.as_str() {
                "migrate-agent" => return self.migrate_agent(&msg).await,
                "hold-agent" => return self.hold_agent(&msg).await,
                "unhold-agent" => return self.unhold_agent(&msg).await,
                "make-backup" => return self.make_backup(&msg).await,
                "open-tunnel" => return self.open_tunnel(&msg).await,
                "close-tunnel" => return self.close_tunnel(&msg).await,
                "launch-outpost" => return self.launch_outpost(&msg).await,
                "stop-outpost" => return self.stop_outpost(&msg).await,
                "show-locations" => return self.show_locations(&msg).await,
                "show-agent-status" => return self.show_agent_status(&msg).await,
                "show-outpost-status" => return self.show_outpost_status(&msg).await,
                "retrieve-info" => return self.retrieve_info(&msg).await,
                "retrieve-msg" => return self.retrieve_messages(&msg).await,
                "store-info" => return self.store_agent_info(&msg).await,
                "store-msg" => return self.store_deferred_message(&msg).await,
                "agents-gathered" => return self.store_agent_resources(&msg).await,
                _ => continue,
            }
        }

        debug!("no handler for message: {}", msg.to_wire());
    }

    // -----------------------------------------------------------------
    // Operator commands

    async fn hold_agent(&self, msg: &Envelope) {
        if !self.has_permissions(msg).await {
            return;
        }
        let Some(agent) = required(msg, "agent") else {
            return self.feedback(msg, "no agent name provided").await;
        };

        let result = {
            let mut config = self.config.lock().await;
            config.mark_hold(agent)
        };

        match result {
            Ok(()) => {
                let reply = format!("agent {agent} is now on hold");
                info!("{reply}");
                self.feedback(msg, &reply).await;
            }
            Err(reason) => {
                error!("error holding agent {agent}: {reason}");
                self.feedback(msg, &reason).await;
            }
        }
    }

    async fn unhold_agent(&self, msg: &Envelope) {
        if !self.has_permissions(msg).await {
            return;
        }
        let Some(agent) = required(msg, "agent") else {
            return self.feedback(msg, "no agent name provided").await;
        };

        let result = {
            let mut config = self.config.lock().await;
            config.mark_unhold(agent)
        };

        match result {
            Ok(()) => {
                let reply = format!("agent {agent} is now free");
                info!("{reply}");
                self.feedback(msg, &reply).await;
            }
            Err(reason) => {
                error!("error unholding agent {agent}: {reason}");
                self.feedback(msg, &reason).await;
            }
        }
    }

    async fn make_backup(&self, msg: &Envelope) {
        if !self.has_permissions(msg).await {
            return;
        }
        let Some(agent) = required(msg, "agent") else {
            return self.feedback(msg, "no agent name provided").await;
        };

        // Only agents resident on central have their files at hand
        let location = {
            let zone = self.zone_book.lock().await;
            zone.agent_location(agent).await.unwrap_or(None)
        };
        if location.as_deref() != Some(CENTRAL) {
            let reply = format!("agent {agent} is not in central");
            error!("{reply}");
            return self.feedback(msg, &reply).await;
        }

        if let Err(e) = rules::prepare_backup(&self.paths, agent) {
            error!("failed to create backup for agent {agent}: {e}");
            return self
                .feedback(msg, &format!("failed to create backup for agent {agent}"))
                .await;
        }

        let reply = format!("created backup for agent {agent}");
        info!("{reply}");
        self.feedback(msg, &reply).await;
    }

    async fn migrate_agent(&self, msg: &Envelope) {
        if !self.has_permissions(msg).await {
            return;
        }
        let Some(agent) = required(msg, "agent") else {
            return self.feedback(msg, "no agent name provided").await;
        };
        let Some(outpost_id) = required(msg, "outpost_id") else {
            return self.feedback(msg, "no outpost id provided").await;
        };

        match migrate::run(self, agent, outpost_id).await {
            Ok(reply) => self.feedback(msg, &reply).await,
            Err(reply) => self.feedback(msg, &reply).await,
        }
    }

    async fn open_tunnel(&self, msg: &Envelope) {
        if !self.has_permissions(msg).await {
            return;
        }
        let Some(outpost_id) = required(msg, "outpost_id") else {
            return self.feedback(msg, "no outpost id provided").await;
        };

        info!("opening tunnel to outpost {outpost_id}");

        let Some(entry) = self.outpost_entry(outpost_id).await else {
            let reply = format!("unknown outpost: {outpost_id}");
            error!("{reply}");
            return self.feedback(msg, &reply).await;
        };

        if self.paths.pid_file(outpost_id).is_file() {
            let reply = format!("there is already a tunnel to outpost {outpost_id}");
            error!("{reply}");
            return self.feedback(msg, &reply).await;
        }

        let opened = {
            let _migration = self.migration.lock().await;
            transport::open_tunnel(&self.paths, &entry).await
        };
        if !opened {
            let reply = format!("failed to open tunnel to outpost {outpost_id}");
            error!("{reply}");
            return self.feedback(msg, &reply).await;
        }

        let reply = format!("opened tunnel to outpost {outpost_id}");
        info!("{reply}");
        info!(target: "scout::status", "tunnel to outpost \"{outpost_id}\" is now open");
        self.feedback(msg, &reply).await;
    }

    async fn close_tunnel(&self, msg: &Envelope) {
        if !self.has_permissions(msg).await {
            return;
        }
        let Some(outpost_id) = required(msg, "outpost_id") else {
            return self.feedback(msg, "no outpost id provided").await;
        };

        info!("closing tunnel to outpost {outpost_id}");

        if self.outpost_entry(outpost_id).await.is_none() {
            let reply = format!("unknown outpost: {outpost_id}");
            error!("{reply}");
            return self.feedback(msg, &reply).await;
        }

        if !self.paths.pid_file(outpost_id).is_file() {
            let reply = format!("there is no tunnel to outpost {outpost_id}");
            error!("{reply}");
            return self.feedback(msg, &reply).await;
        }

        let closed = {
            let _migration = self.migration.lock().await;
            transport::close_tunnel(&self.paths, outpost_id).await
        };
        if !closed {
            let reply = format!("failed to close tunnel to outpost {outpost_id}");
            error!("{reply}");
            return self.feedback(msg, &reply).await;
        }

        let reply = format!("closed tunnel to outpost {outpost_id}");
        info!("{reply}");
        info!(target: "scout::status", "tunnel to outpost \"{outpost_id}\" is now closed");
        self.feedback(msg, &reply).await;
    }

    async fn launch_outpost(&self, msg: &Envelope) {
        if !self.has_permissions(msg).await {
            return;
        }
        let Some(outpost_id) = required(msg, "outpost_id") else {
            return self.feedback(msg, "no outpost id provided").await;
        };

        info!("launching outpost {outpost_id}");

        let Some(entry) = self.outpost_entry(outpost_id).await else {
            let reply = format!("unknown outpost: {outpost_id}");
            error!("{reply}");
            return self.feedback(msg, &reply).await;
        };

        // Flip the flag first so concurrent migrations see the outpost
        {
            let zone = self.zone_book.lock().await;

            if zone.is_running(outpost_id).await.unwrap_or(None) == Some(true) {
                let reply = format!("outpost {outpost_id} is already running");
                error!("{reply}");
                return self.feedback(msg, &reply).await;
            }

            if !zone.set_running(outpost_id, true).await.unwrap_or(false) {
                let reply = format!("failed to change running status of {outpost_id}");
                error!("{reply}");
                return self.feedback(msg, &reply).await;
            }
        }

        let launched = {
            let _migration = self.migration.lock().await;
            transport::launch_outpost(&entry).await
        };
        if !launched {
            let reply = format!("failed to remotely launch outpost {outpost_id}");
            error!("{reply}");
            self.record_running(outpost_id, false).await;
            return self.feedback(msg, &reply).await;
        }

        let reply = format!("launched outpost {outpost_id}");
        info!("{reply}");
        info!(target: "scout::status", "outpost \"{outpost_id}\" is now running");
        self.feedback(msg, &reply).await;
    }

    async fn stop_outpost(&self, msg: &Envelope) {
        if !self.has_permissions(msg).await {
            return;
        }
        let Some(outpost_id) = required(msg, "outpost_id") else {
            return self.feedback(msg, "no outpost id provided").await;
        };

        info!("stopping outpost {outpost_id}");

        let Some(entry) = self.outpost_entry(outpost_id).await else {
            let reply = format!("unknown outpost: {outpost_id}");
            error!("{reply}");
            return self.feedback(msg, &reply).await;
        };

        {
            let zone = self.zone_book.lock().await;

            if zone.is_running(outpost_id).await.unwrap_or(None) != Some(true) {
                let reply = format!("outpost {outpost_id} is not currently running");
                error!("{reply}");
                return self.feedback(msg, &reply).await;
            }

            if !zone.set_running(outpost_id, false).await.unwrap_or(false) {
                let reply = format!("failed to change running status of {outpost_id}");
                error!("{reply}");
                return self.feedback(msg, &reply).await;
            }
        }

        let stopped = {
            let _migration = self.migration.lock().await;
            transport::stop_outpost(&entry).await
        };
        if !stopped {
            let reply = format!("failed to remotely stop outpost {outpost_id}");
            error!("{reply}");
            self.record_running(outpost_id, true).await;
            return self.feedback(msg, &reply).await;
        }

        let reply = format!("stopped outpost {outpost_id}");
        info!("{reply}");
        info!(target: "scout::status", "outpost \"{outpost_id}\" is now stopped");
        self.feedback(msg, &reply).await;
    }

    async fn show_locations(&self, msg: &Envelope) {
        if !self.has_permissions(msg).await {
            return;
        }

        info!("obtaining agent locations");

        let mut names = {
            let config = self.config.lock().await;
            config.outpost_names()
        };
        names.push(CENTRAL.to_string());

        let mut locations = Vec::new();
        {
            let zone = self.zone_book.lock().await;
            for name in &names {
                let agents = zone.agent_names_in(name).await.unwrap_or_default();
                locations.push((name.clone(), agents));
            }
        }

        self.feedback(msg, &messages::feedback_agent_locations(&locations))
            .await;
    }

    async fn show_agent_status(&self, msg: &Envelope) {
        if !self.has_permissions(msg).await {
            return;
        }

        info!("obtaining status of agents");

        let agents = {
            let zone = self.zone_book.lock().await;
            zone.list_agents().await.unwrap_or_default()
        };
        let hold = {
            let config = self.config.lock().await;
            config.hold_list()
        };

        self.feedback(msg, &messages::feedback_agent_status(&agents, &hold))
            .await;
    }

    async fn show_outpost_status(&self, msg: &Envelope) {
        if !self.has_permissions(msg).await {
            return;
        }

        info!("obtaining status of outposts");

        let outposts = {
            let zone = self.zone_book.lock().await;
            zone.list_outposts().await.unwrap_or_default()
        };
        let report = {
            let config = self.config.lock().await;
            messages::feedback_outpost_status(&outposts, &config)
        };

        self.feedback(msg, &report).await;
    }

    // -----------------------------------------------------------------
    // Migration machinery

    async fn retrieve_info(&self, msg: &Envelope) {
        if !self.has_permissions(msg).await {
            return;
        }
        let Some(agent) = required(msg, "agent") else {
            return self.feedback(msg, "no agent name provided").await;
        };

        info!("retrieving info for {agent}");

        let dispatched = {
            let book = self.agent_book.lock().await;
            match book.get_info(agent).await {
                Ok(Some(info)) => {
                    if let Err(e) = self.bus.send_raw(&info).await {
                        // Keep the blob so retrieval can be retried
                        error!("failed to dispatch stored information of agent {agent}: {e}");
                        return self
                            .feedback(
                                msg,
                                &format!("failed to retrieve stored information of agent {agent}"),
                            )
                            .await;
                    }
                    if let Err(e) = book.delete_info(agent).await {
                        error!("failed to delete stored information of agent {agent}: {e}");
                    }
                    true
                }
                Ok(None) => false,
                Err(e) => {
                    error!("agent book error: {e}");
                    false
                }
            }
        };

        if dispatched {
            return self.feedback(msg, "retrieved stored information").await;
        }

        info!("no information stored for agent {agent}");
        self.feedback(msg, "no information stored, will retrieve messages anyway")
            .await;

        // Retrieve stored messages anyway
        self.replay_messages(msg, agent).await;
    }

    async fn retrieve_messages(&self, msg: &Envelope) {
        if !self.has_permissions(msg).await {
            return;
        }
        let Some(agent) = required(msg, "agent") else {
            return self.feedback(msg, "no agent name provided").await;
        };

        info!("retrieving messages for {agent}");
        self.replay_messages(msg, agent).await;
    }

    /// Dispatch every deferred message in insertion order, then clear the
    /// queue. On a dispatch failure the queue is kept for a retry.
    async fn replay_messages(&self, msg: &Envelope, agent: &str) {
        let stored = {
            let book = self.agent_book.lock().await;
            book.get_messages(agent).await.unwrap_or_else(|e| {
                error!("agent book error: {e}");
                Vec::new()
            })
        };

        for raw in &stored {
            if let Err(e) = self.bus.send_raw(raw).await {
                error!("failed to replay deferred message for agent {agent}: {e}");
                return self
                    .feedback(msg, &format!("failed to replay stored messages for agent {agent}"))
                    .await;
            }
        }

        {
            let book = self.agent_book.lock().await;
            if let Err(e) = book.delete_messages(agent).await {
                error!("failed to clear deferred messages of agent {agent}: {e}");
            }
        }

        let reply = format!("retrieved stored messages for agent {agent}");
        info!("{reply}");
        self.feedback(msg, &reply).await;
    }

    async fn store_agent_info(&self, msg: &Envelope) {
        info!(
            "storing information of agent {}",
            msg.get("agent").unwrap_or("?")
        );

        let book = self.agent_book.lock().await;
        if let Err(e) = book.store_info(msg).await {
            error!("failed to store agent information: {e}");
        }
    }

    async fn store_deferred_message(&self, msg: &Envelope) {
        info!(
            "storing deferred message for agent {}",
            msg.get("_outpost_dst").unwrap_or("?")
        );

        let book = self.agent_book.lock().await;
        if let Err(e) = book.store_message(msg).await {
            error!("failed to store deferred message: {e}");
        }
    }

    async fn store_agent_resources(&self, msg: &Envelope) {
        info!("received message to update agent resources");

        let pairs: HashMap<String, String> = msg.pairs().iter().cloned().collect();
        self.store_gathered(&pairs).await;
    }

    /// Commit gathered samples (`agent-<name>` keys) into the zone book.
    async fn store_gathered(&self, samples: &HashMap<String, String>) {
        let zone = self.zone_book.lock().await;

        for (key, value) in samples {
            let Some(agent) = key.strip_prefix("agent-") else {
                continue;
            };

            let mips = match serial::deserialize_f64(value) {
                Ok(mips) => mips,
                Err(e) => {
                    warn!("unreadable sample for agent {agent}: {e}");
                    continue;
                }
            };

            match zone.update_resources(agent, mips, now_epoch()).await {
                Ok(true) => {
                    info!("updated resource information for agent {agent}");
                    info!(target: "scout::status", "resources of agent \"{agent}\"; MIPS: {mips}");
                }
                _ => info!("failed to update resources for agent {agent}"),
            }
        }
    }

    // -----------------------------------------------------------------
    // Helpers

    async fn outpost_entry(&self, name: &str) -> Option<OutpostEntry> {
        let config = self.config.lock().await;
        config.outpost(name)
    }

    /// Operator commands are accepted from the local terminal (no sender)
    /// or from members of the admins group.
    async fn has_permissions(&self, msg: &Envelope) -> bool {
        let Some(sender) = msg.get("sender").filter(|s| !s.is_empty()) else {
            return true;
        };

        let is_admin = IniFile::load(&self.paths.users_conf)
            .ok()
            .and_then(|users| {
                users
                    .get("group admins", "members")
                    .map(|m| m.split_whitespace().any(|u| u == sender))
            })
            .unwrap_or(false);

        if is_admin {
            return true;
        }

        self.feedback_to(messages::feedback_permissions(), Some(sender), msg.get("src"))
            .await;
        false
    }

    /// Send feedback to whoever triggered the command.
    async fn feedback(&self, origin: &Envelope, message: &str) {
        let user = origin.get("sender").filter(|s| !s.is_empty());
        let dst = origin.get("src").filter(|s| !s.is_empty());
        self.feedback_to(message, user, dst).await;
    }

    async fn feedback_to(&self, message: &str, user: Option<&str>, dst: Option<&str>) {
        if user.is_none() && dst.is_none() {
            return;
        }

        let mut reply = Envelope::from_pairs(&[("dst", "relay")]);
        if let Some(dst) = dst {
            reply.push("relayto", dst);
        }
        if let Some(user) = user {
            reply.push("to", user);
        }

        if dst == Some("mail") {
            reply.push("subject", "Scout");
            reply.push("txt", message);
        } else {
            reply.push("msg", message);
        }

        self.send(&reply).await;
    }

    pub(crate) async fn send(&self, msg: &Envelope) {
        if let Err(e) = self.bus.send(msg).await {
            error!("failed to send message to bus: {e}");
        }
    }
}

fn required<'a>(msg: &'a Envelope, key: &str) -> Option<&'a str> {
    let value = msg.get(key).filter(|v| !v.is_empty());
    if value.is_none() {
        error!("no {key} provided");
    }
    value
}

/// Accept loop of the scout's bus endpoint: each connection carries one
/// message, handled concurrently under the controller's locks.
pub async fn serve(scout: Arc<Scout>, listener: TcpListener) -> Result<()> {
    loop {
        let (mut sock, addr) = listener.accept().await?;
        let scout = scout.clone();

        tokio::spawn(async move {
            let raw = match read_message(&mut sock).await {
                Ok(raw) => raw,
                Err(e) => {
                    error!("failed to read message from {addr}: {e}");
                    return;
                }
            };

            match Envelope::parse(&raw) {
                Ok(msg) => scout.handle(msg).await,
                Err(e) => error!("discarding malformed message from {addr}: {e}"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_devkit::BusStub;

    const SCOUT_CONF: &str = "\
[general]
balance =
mips = 3000
priority = 10
perf_path = /usr/bin/perf

[agents]
free = a1 a2
hold =
";

    const OUTPOST_LIST: &str = "\
[outpost o1]
host = o1.example.org
directory = /opt/hive
remote_port = 30000
local_tunnel = 30100
remote_tunnel = 30200
mips = 1000
priority = 1
";

    const HIVE_CONF: &str = "\
[agent scout]
port = 30001

[agent a1]
port = 30101

[agent a2]
port = 30102
";

    const USERS_CONF: &str = "\
[group admins]
members = boss
";

    async fn test_scout() -> (tempfile::TempDir, BusStub, Arc<Scout>) {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().to_path_buf();

        let etc_scout = home.join("etc/scout");
        std::fs::create_dir_all(etc_scout.join("rules/a1")).unwrap();
        std::fs::create_dir_all(etc_scout.join("rules/a2")).unwrap();
        std::fs::create_dir_all(home.join("var")).unwrap();
        std::fs::create_dir_all(home.join("logs")).unwrap();
        std::fs::write(etc_scout.join("scout.conf"), SCOUT_CONF).unwrap();
        std::fs::write(etc_scout.join("outpost.list"), OUTPOST_LIST).unwrap();
        std::fs::write(home.join("etc/hive.conf"), HIVE_CONF).unwrap();
        std::fs::write(home.join("etc/hive-users.conf"), USERS_CONF).unwrap();

        let stub = BusStub::start().await.unwrap();
        let paths = Paths::for_home(
            home.clone(),
            home.join("var"),
            home.join("logs"),
            stub.host(),
            stub.port(),
        )
        .unwrap();

        let agent_book = AgentBook::open(&paths.agent_book_db).await.unwrap();
        let zone_book = ZoneBook::open(&paths.zone_book_db).await.unwrap();
        let config =
            ConfigStore::load(paths.scout_conf.clone(), paths.outpost_list.clone()).unwrap();

        let scout = Scout::new(paths, Bus::new(stub.host(), stub.port()), agent_book, zone_book, config);
        (dir, stub, scout)
    }

    fn parse(raw: &str) -> Envelope {
        Envelope::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn refresh_populates_books_from_rules() {
        let (_dir, _stub, scout) = test_scout().await;

        scout.refresh_info().await.unwrap();

        let zone = scout.zone_book.lock().await;
        let agents = zone.list_agents().await.unwrap();
        assert_eq!(agents.len(), 2);
        assert!(agents.iter().all(|a| a.location == CENTRAL));
        assert!(zone
            .list_outposts()
            .await
            .unwrap()
            .iter()
            .any(|o| o.name == CENTRAL));
    }

    #[tokio::test]
    async fn hold_command_replies_through_the_relay() {
        let (_dir, stub, scout) = test_scout().await;

        scout
            .handle(parse("dst=scout&tag=hold-agent&agent=a1&sender=&src=cmdproc"))
            .await;

        let replies = stub.wait_for(1, Duration::from_secs(2)).await;
        assert_eq!(replies[0].dst(), Some("relay"));
        assert_eq!(replies[0].get("relayto"), Some("cmdproc"));
        assert_eq!(replies[0].get("msg"), Some("agent a1 is now on hold"));

        stub.clear();
        scout
            .handle(parse("dst=scout&tag=hold-agent&agent=a1&sender=&src=cmdproc"))
            .await;

        let replies = stub.wait_for(1, Duration::from_secs(2)).await;
        assert_eq!(
            replies[0].get("msg"),
            Some("agent a1 is already in hold list")
        );
    }

    #[tokio::test]
    async fn migration_to_unknown_outpost_changes_nothing() {
        let (_dir, stub, scout) = test_scout().await;
        scout.refresh_info().await.unwrap();

        scout
            .handle(parse(
                "dst=scout&tag=migrate-agent&agent=a1&outpost_id=o99&sender=&src=cmdproc",
            ))
            .await;

        let replies = stub.wait_for(1, Duration::from_secs(2)).await;
        assert_eq!(replies[0].get("msg"), Some("unknown outpost: o99"));

        let zone = scout.zone_book.lock().await;
        assert_eq!(
            zone.agent_location("a1").await.unwrap(),
            Some(CENTRAL.to_string())
        );
    }

    #[tokio::test]
    async fn non_admin_senders_are_rejected() {
        let (_dir, stub, scout) = test_scout().await;

        scout
            .handle(parse(
                "dst=scout&tag=hold-agent&agent=a1&sender=intruder&src=cmdproc",
            ))
            .await;

        let replies = stub.wait_for(1, Duration::from_secs(2)).await;
        assert_eq!(
            replies[0].get("msg"),
            Some("You do not have the required permissions")
        );

        // The hold must not have happened
        let config = scout.config.lock().await;
        assert!(config.hold_list().is_empty());
    }

    #[tokio::test]
    async fn admins_pass_the_permission_check() {
        let (_dir, stub, scout) = test_scout().await;

        scout
            .handle(parse("dst=scout&tag=hold-agent&agent=a1&sender=boss&src=cmdproc"))
            .await;

        let replies = stub.wait_for(1, Duration::from_secs(2)).await;
        assert_eq!(replies[0].get("msg"), Some("agent a1 is now on hold"));
    }

    #[tokio::test]
    async fn stored_info_roundtrip_dispatches_a_settle() {
        let (_dir, stub, scout) = test_scout().await;

        scout
            .handle(parse("dst=scout&tag=store-info&agent=a1&state=YQ[["))
            .await;
        scout
            .handle(parse("dst=scout&tag=retrieve-info&agent=a1&sender=&src=cmdproc"))
            .await;

        let messages = stub.wait_for(2, Duration::from_secs(2)).await;
        assert_eq!(messages[0].dst(), Some("a1"));
        assert!(messages[0].has_tag("settle!"));
        assert_eq!(messages[0].get("state"), Some("YQ[["));
        assert_eq!(messages[1].get("msg"), Some("retrieved stored information"));

        // The blob is consumed by retrieval
        let book = scout.agent_book.lock().await;
        assert_eq!(book.get_info("a1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn retrieve_info_without_blob_replays_messages() {
        let (_dir, stub, scout) = test_scout().await;

        scout
            .handle(parse(
                "dst=scout&tag=store-msg&_outpost_dst=a1&_outpost_tag=ping&seq=0",
            ))
            .await;
        scout
            .handle(parse(
                "dst=scout&tag=store-msg&_outpost_dst=a1&_outpost_tag=ping&seq=1",
            ))
            .await;
        scout
            .handle(parse("dst=scout&tag=retrieve-info&agent=a1&sender=&src=cmdproc"))
            .await;

        // no-info feedback, two replayed messages, final feedback
        let messages = stub.wait_for(4, Duration::from_secs(2)).await;
        assert_eq!(
            messages[0].get("msg"),
            Some("no information stored, will retrieve messages anyway")
        );
        assert_eq!(messages[1].get("seq"), Some("0"));
        assert!(messages[1].has_tag("ping"));
        assert_eq!(messages[2].get("seq"), Some("1"));
        assert_eq!(
            messages[3].get("msg"),
            Some("retrieved stored messages for agent a1")
        );

        let book = scout.agent_book.lock().await;
        assert!(book.get_messages("a1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn outpost_lifecycle_validations() {
        let (_dir, stub, scout) = test_scout().await;
        scout.refresh_info().await.unwrap();

        scout
            .handle(parse(
                "dst=scout&tag=launch-outpost&outpost_id=o99&sender=&src=cmdproc",
            ))
            .await;
        let replies = stub.wait_for(1, Duration::from_secs(2)).await;
        assert_eq!(replies[0].get("msg"), Some("unknown outpost: o99"));

        // o1 exists but was never started: stopping it is a validation error
        stub.clear();
        scout
            .handle(parse(
                "dst=scout&tag=stop-outpost&outpost_id=o1&sender=&src=cmdproc",
            ))
            .await;
        let replies = stub.wait_for(1, Duration::from_secs(2)).await;
        assert_eq!(
            replies[0].get("msg"),
            Some("outpost o1 is not currently running")
        );
    }

    #[tokio::test]
    async fn closing_a_missing_tunnel_is_reported() {
        let (_dir, stub, scout) = test_scout().await;

        scout
            .handle(parse(
                "dst=scout&tag=close-tunnel&outpost_id=o1&sender=&src=cmdproc",
            ))
            .await;

        let replies = stub.wait_for(1, Duration::from_secs(2)).await;
        assert_eq!(
            replies[0].get("msg"),
            Some("there is no tunnel to outpost o1")
        );
    }

    #[tokio::test]
    async fn gathered_resources_land_in_the_zone_book() {
        let (_dir, _stub, scout) = test_scout().await;
        scout.refresh_info().await.unwrap();

        let blob = serial::serialize_f64(250.0);
        scout
            .handle(parse(&format!(
                "dst=scout&tag=agents-gathered&agent-a1={blob}"
            )))
            .await;

        let zone = scout.zone_book.lock().await;
        let a1 = zone
            .list_agents()
            .await
            .unwrap()
            .into_iter()
            .find(|a| a.name == "a1")
            .unwrap();
        assert_eq!(a1.mips, 250.0);
    }

    #[tokio::test]
    async fn locations_report_covers_outposts_and_central() {
        let (_dir, stub, scout) = test_scout().await;
        scout.refresh_info().await.unwrap();

        scout
            .handle(parse("dst=scout&tag=show-locations&sender=&src=cmdproc"))
            .await;

        let replies = stub.wait_for(1, Duration::from_secs(2)).await;
        let report = replies[0].get("msg").unwrap();
        assert!(report.starts_with("# Agent locations"));
        assert!(report.contains("o1\n---------\n"));
        assert!(report.contains("central\n---------\na1\na2"));
    }
}
