/**
 * HIVE SCOUT - Point d'entrée du contrôleur central
 *
 * RÔLE : Bootstrap complet du scout : environnement, journalisation,
 * ouverture des livres sqlite, chargement de la configuration, première
 * synchronisation, tunnels vers les outposts, minuteries périodiques et
 * boucle d'écoute du bus.
 *
 * ARCHITECTURE : messages bus entrants -> handlers sous verrous nommés ;
 * quatre minuteries indépendantes pilotent les rafraîchissements et
 * l'équilibrage de charge.
 */
use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use hive_core::IniFile;
use hive_scout::book::{AgentBook, ZoneBook};
use hive_scout::bus::Bus;
use hive_scout::config::ConfigStore;
use hive_scout::controller::{self, Scout};
use hive_scout::messages;
use hive_scout::paths::Paths;

#[tokio::main]
async fn main() -> Result<()> {
    // variables d'environnement (.env accepté)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let paths = Paths::from_env()?;
    println!("[scout] platform home: {}", paths.home.display());

    // l'arborescence du scout doit exister avant la première synchro
    std::fs::create_dir_all(&paths.rules)
        .with_context(|| format!("cannot create {}", paths.rules.display()))?;
    std::fs::create_dir_all(&paths.var)?;
    std::fs::create_dir_all(&paths.logs)?;

    let agent_book = AgentBook::open(&paths.agent_book_db).await?;
    let zone_book = ZoneBook::open(&paths.zone_book_db).await?;
    let config = ConfigStore::load(paths.scout_conf.clone(), paths.outpost_list.clone())
        .context("unreadable scout configuration")?;

    // Le port du scout vient du registre d'agents de la plateforme
    let hive_conf = IniFile::load(&paths.hive_conf)?;
    let scout_port: u16 = hive_conf
        .get("agent scout", "port")
        .context("agent scout has no port configured")?
        .parse()
        .context("invalid scout port")?;

    let bus = Bus::new(paths.server_host.clone(), paths.server_port);

    // Enregistrement auprès du serveur de la plateforme
    let register =
        messages::register_local("scout", &paths.server_host, &scout_port.to_string());
    if let Err(e) = bus.send(&register).await {
        eprintln!("[scout] could not register with the platform server: {e}");
    }

    let scout = Scout::new(paths, bus, agent_book, zone_book, config);

    // Première synchronisation avant d'ouvrir quoi que ce soit
    scout.refresh_info().await?;

    // Tunnels + lancement des outposts configurés
    scout.startup().await;

    // Boucles périodiques
    scout.spawn_timers();

    // Boucle d'écoute du bus
    let listener = TcpListener::bind(("127.0.0.1", scout_port))
        .await
        .with_context(|| format!("cannot bind scout port {scout_port}"))?;
    println!("[scout] listening on 127.0.0.1:{scout_port}");

    controller::serve(scout, listener).await
}
