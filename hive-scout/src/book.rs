/**
 * LIVRES DE BORD - Stockage durable du scout (sqlite)
 *
 * RÔLE : Deux bases séparées. L'agent book garde l'état capturé d'un agent
 * en voyage et ses messages différés ; le zone book garde la position de
 * chaque agent, l'état des outposts et les derniers MIPS mesurés.
 *
 * FONCTIONNEMENT : sqlx/sqlite, schéma créé à l'ouverture. Les écritures
 * se font sous le verrou nommé correspondant (côté contrôleur).
 */
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{error, info, warn};

use hive_core::Envelope;

use crate::paths::CENTRAL;

/// Epoch seconds used for the `timestamp` columns.
pub fn now_epoch() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

async fn open_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true);

    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .with_context(|| format!("cannot open database {}", db_path.display()))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Agent book

/// Store for captured agent state and deferred messages.
pub struct AgentBook {
    pool: SqlitePool,
}

impl AgentBook {
    pub async fn open(db_path: &Path) -> Result<Self> {
        let pool = open_pool(db_path).await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS agent_info (
                agent   TEXT NOT NULL UNIQUE,
                info    TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS agent_messages (
                id      INTEGER PRIMARY KEY AUTOINCREMENT,
                agent   TEXT NOT NULL,
                message TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Store the captured attributes carried by a `store-info` message.
    ///
    /// The message is rewritten for direct dispatch on retrieval: it is
    /// re-addressed to the agent itself and re-tagged `settle!`.
    pub async fn store_info(&self, msg: &Envelope) -> Result<()> {
        let agent = msg
            .get("agent")
            .context("store-info message has no agent field")?
            .to_string();

        info!("storing information of agent {agent}");

        let mut stored = msg.clone();
        stored.set("dst", &agent);
        stored.remove("agent");
        // Original tags removed, retrieval must deliver a settle!
        stored.remove("tag");
        stored.push("tag", "settle!");

        let result = sqlx::query("INSERT INTO agent_info (agent, info) VALUES (?1, ?2)")
            .bind(&agent)
            .bind(stored.to_wire())
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                error!("failed to store information of agent {agent}: already stored");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Return the stored `settle!` message, if any.
    pub async fn get_info(&self, agent: &str) -> Result<Option<String>> {
        info!("obtaining stored information of agent {agent}");

        let row = sqlx::query("SELECT info FROM agent_info WHERE agent = ?1")
            .bind(agent)
            .fetch_optional(&self.pool)
            .await?;

        if row.is_none() {
            error!("no information stored for agent {agent}");
        }

        Ok(row.map(|r| r.get("info")))
    }

    /// Delete the stored information for an agent.
    pub async fn delete_info(&self, agent: &str) -> Result<bool> {
        info!("deleting stored information of agent {agent}");

        let result = sqlx::query("DELETE FROM agent_info WHERE agent = ?1")
            .bind(agent)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            error!("no information to delete for agent {agent}");
            return Ok(false);
        }
        Ok(true)
    }

    /// Store a deferred message. The special `_outpost_*` fields are folded
    /// back into the original envelope so retrieval can dispatch directly.
    pub async fn store_message(&self, msg: &Envelope) -> Result<()> {
        let agent = msg
            .get("_outpost_dst")
            .context("deferred message has no _outpost_dst field")?
            .to_string();

        info!("storing deferred message for agent {agent}");

        let restored = hive_core::envelope::defer_restore(msg);

        sqlx::query("INSERT INTO agent_messages (agent, message) VALUES (?1, ?2)")
            .bind(&agent)
            .bind(restored.to_wire())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// All deferred messages for an agent, in insertion order.
    pub async fn get_messages(&self, agent: &str) -> Result<Vec<String>> {
        info!("obtaining stored messages for agent {agent}");

        let rows = sqlx::query(
            "SELECT message FROM agent_messages WHERE agent = ?1 ORDER BY id",
        )
        .bind(agent)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.get("message")).collect())
    }

    pub async fn delete_messages(&self, agent: &str) -> Result<()> {
        info!("deleting stored messages of agent {agent}");

        sqlx::query("DELETE FROM agent_messages WHERE agent = ?1")
            .bind(agent)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Zone book

#[derive(Debug, Clone)]
pub struct OutpostRecord {
    pub name: String,
    pub is_running: bool,
    pub timestamp: f64,
}

#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub name: String,
    pub mips: f64,
    pub location: String,
    pub timestamp: f64,
}

/// Store for agent locations and outpost status.
pub struct ZoneBook {
    pool: SqlitePool,
}

impl ZoneBook {
    pub async fn open(db_path: &Path) -> Result<Self> {
        let pool = open_pool(db_path).await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS outposts (
                name        TEXT NOT NULL UNIQUE,
                is_running  INTEGER NOT NULL DEFAULT 0,
                timestamp   REAL NOT NULL DEFAULT 0
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS agents (
                name        TEXT NOT NULL UNIQUE,
                mips        REAL NOT NULL DEFAULT 0,
                location    TEXT NOT NULL REFERENCES outposts(name),
                timestamp   REAL NOT NULL DEFAULT 0
            )",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Create an outpost row if it does not exist. Outposts are never
    /// deleted, only their `is_running` flag changes.
    pub async fn upsert_outpost(&self, name: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO outposts (name, is_running, timestamp) VALUES (?1, 0, ?2)",
        )
        .bind(name)
        .bind(now_epoch())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_outposts(&self) -> Result<Vec<OutpostRecord>> {
        let rows = sqlx::query("SELECT name, is_running, timestamp FROM outposts ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|r| OutpostRecord {
                name: r.get("name"),
                is_running: r.get::<i64, _>("is_running") != 0,
                timestamp: r.get("timestamp"),
            })
            .collect())
    }

    /// Whether an outpost is known to be running. `None` when the outpost
    /// is not in the book.
    pub async fn is_running(&self, name: &str) -> Result<Option<bool>> {
        info!("checking if outpost {name} is currently running");

        let row = sqlx::query("SELECT is_running FROM outposts WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        if row.is_none() {
            warn!("outpost {name} not found in zone book");
        }

        Ok(row.map(|r| r.get::<i64, _>("is_running") != 0))
    }

    pub async fn set_running(&self, name: &str, value: bool) -> Result<bool> {
        info!("setting running status of outpost {name} to: {value}");

        let result = sqlx::query(
            "UPDATE outposts SET is_running = ?2, timestamp = ?3 WHERE name = ?1",
        )
        .bind(name)
        .bind(value as i64)
        .bind(now_epoch())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            error!("could not set running status of outpost {name}");
            return Ok(false);
        }
        Ok(true)
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentRecord>> {
        let rows =
            sqlx::query("SELECT name, mips, location, timestamp FROM agents ORDER BY rowid")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(agent_record).collect())
    }

    /// Agents currently located in the given outpost, in registration order.
    pub async fn agents_in(&self, outpost: &str) -> Result<Vec<AgentRecord>> {
        info!("obtaining agents located in {outpost}");

        let rows = sqlx::query(
            "SELECT name, mips, location, timestamp FROM agents
             WHERE location = ?1 ORDER BY rowid",
        )
        .bind(outpost)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(agent_record).collect())
    }

    pub async fn agent_names_in(&self, outpost: &str) -> Result<Vec<String>> {
        Ok(self
            .agents_in(outpost)
            .await?
            .into_iter()
            .map(|a| a.name)
            .collect())
    }

    pub async fn agent_location(&self, name: &str) -> Result<Option<String>> {
        info!("obtaining location of agent {name}");

        let row = sqlx::query("SELECT location FROM agents WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        if row.is_none() {
            warn!("could not get location of agent {name}");
        }

        Ok(row.map(|r| r.get("location")))
    }

    /// Move an agent to a new location. Fails when the destination outpost
    /// or the agent is unknown.
    pub async fn move_agent(&self, name: &str, location: &str) -> Result<bool> {
        info!("moving agent {name} to {location}");

        let outpost = sqlx::query("SELECT name FROM outposts WHERE name = ?1")
            .bind(location)
            .fetch_optional(&self.pool)
            .await?;

        if outpost.is_none() {
            error!("could not update location of agent {name}: unknown outpost {location}");
            return Ok(false);
        }

        let result = sqlx::query(
            "UPDATE agents SET location = ?2, timestamp = ?3 WHERE name = ?1",
        )
        .bind(name)
        .bind(location)
        .bind(now_epoch())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            error!("could not update location of agent {name}");
            return Ok(false);
        }
        Ok(true)
    }

    /// Update the measured resources of an agent, creating the record on
    /// central when it is not known yet.
    pub async fn update_resources(&self, name: &str, mips: f64, timestamp: f64) -> Result<bool> {
        info!("updating resources of agent {name}");

        let result = sqlx::query(
            "UPDATE agents SET mips = ?2, timestamp = ?3 WHERE name = ?1",
        )
        .bind(name)
        .bind(mips)
        .bind(timestamp)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        self.upsert_outpost(CENTRAL).await?;
        sqlx::query(
            "INSERT OR IGNORE INTO agents (name, mips, location, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(name)
        .bind(mips)
        .bind(CENTRAL)
        .bind(timestamp)
        .execute(&self.pool)
        .await?;

        Ok(true)
    }

    /// Reconcile the agents table with the rules directory: missing agents
    /// are created on central, agents whose directory disappeared are
    /// deleted. This is the only operation that deletes agent rows.
    pub async fn refresh_agents(&self, expected: &[String]) -> Result<()> {
        info!("refreshing agent list");

        self.upsert_outpost(CENTRAL).await?;

        for agent in expected {
            sqlx::query(
                "INSERT OR IGNORE INTO agents (name, mips, location, timestamp)
                 VALUES (?1, 0, ?2, ?3)",
            )
            .bind(agent)
            .bind(CENTRAL)
            .bind(now_epoch())
            .execute(&self.pool)
            .await?;
        }

        let current: Vec<String> = self
            .list_agents()
            .await?
            .into_iter()
            .map(|a| a.name)
            .collect();

        for stale in current.iter().filter(|name| !expected.contains(name)) {
            sqlx::query("DELETE FROM agents WHERE name = ?1")
                .bind(stale)
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }

    /// Create rows for outposts seen in the outpost list. Outposts that no
    /// longer appear are kept for historic purposes.
    pub async fn refresh_outposts(&self, names: &[String]) -> Result<()> {
        info!("refreshing outpost list");

        for name in names {
            self.upsert_outpost(name).await?;
        }
        Ok(())
    }
}

fn agent_record(r: sqlx::sqlite::SqliteRow) -> AgentRecord {
    AgentRecord {
        name: r.get("name"),
        mips: r.get("mips"),
        location: r.get("location"),
        timestamp: r.get("timestamp"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn zone_book() -> (tempfile::TempDir, ZoneBook) {
        let dir = tempfile::tempdir().unwrap();
        let book = ZoneBook::open(&dir.path().join("zonebook.sqlite"))
            .await
            .unwrap();
        (dir, book)
    }

    async fn agent_book() -> (tempfile::TempDir, AgentBook) {
        let dir = tempfile::tempdir().unwrap();
        let book = AgentBook::open(&dir.path().join("agentbook.sqlite"))
            .await
            .unwrap();
        (dir, book)
    }

    #[tokio::test]
    async fn refresh_creates_agents_on_central() {
        let (_dir, book) = zone_book().await;

        book.refresh_agents(&["a1".into(), "a2".into()]).await.unwrap();

        let agents = book.list_agents().await.unwrap();
        assert_eq!(agents.len(), 2);
        assert!(agents.iter().all(|a| a.location == CENTRAL));
        assert!(book
            .list_outposts()
            .await
            .unwrap()
            .iter()
            .any(|o| o.name == CENTRAL));
    }

    #[tokio::test]
    async fn refresh_deletes_agents_without_rules() {
        let (_dir, book) = zone_book().await;

        book.refresh_agents(&["a1".into(), "a2".into()]).await.unwrap();
        book.refresh_agents(&["a2".into()]).await.unwrap();

        let names: Vec<String> = book
            .list_agents()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, vec!["a2"]);
    }

    #[tokio::test]
    async fn unknown_outpost_running_state_is_none() {
        let (_dir, book) = zone_book().await;
        assert_eq!(book.is_running("vault").await.unwrap(), None);

        book.upsert_outpost("vault").await.unwrap();
        assert_eq!(book.is_running("vault").await.unwrap(), Some(false));

        assert!(book.set_running("vault", true).await.unwrap());
        assert_eq!(book.is_running("vault").await.unwrap(), Some(true));
    }

    #[tokio::test]
    async fn move_agent_requires_known_outpost() {
        let (_dir, book) = zone_book().await;
        book.refresh_agents(&["a1".into()]).await.unwrap();

        assert!(!book.move_agent("a1", "vault").await.unwrap());

        book.upsert_outpost("vault").await.unwrap();
        assert!(book.move_agent("a1", "vault").await.unwrap());
        assert_eq!(
            book.agent_location("a1").await.unwrap(),
            Some("vault".into())
        );
        assert_eq!(book.agent_names_in("vault").await.unwrap(), vec!["a1"]);
    }

    #[tokio::test]
    async fn resources_update_creates_missing_agents() {
        let (_dir, book) = zone_book().await;

        assert!(book.update_resources("a1", 250.0, 1000.0).await.unwrap());
        let agents = book.list_agents().await.unwrap();
        assert_eq!(agents[0].mips, 250.0);
        assert_eq!(agents[0].location, CENTRAL);

        assert!(book.update_resources("a1", 300.0, 2000.0).await.unwrap());
        assert_eq!(book.list_agents().await.unwrap()[0].mips, 300.0);
    }

    #[tokio::test]
    async fn stored_info_is_rewritten_for_dispatch() {
        let (_dir, book) = agent_book().await;

        let msg = Envelope::parse("dst=scout&tag=store-info&agent=a1&counter=YQ[[").unwrap();
        book.store_info(&msg).await.unwrap();

        let info = book.get_info("a1").await.unwrap().unwrap();
        let stored = Envelope::parse(&info).unwrap();
        assert_eq!(stored.dst(), Some("a1"));
        assert_eq!(stored.tags(), vec!["settle!"]);
        assert_eq!(stored.get("agent"), None);
        assert_eq!(stored.get("counter"), Some("YQ[["));
    }

    #[tokio::test]
    async fn duplicate_info_is_kept_not_overwritten() {
        let (_dir, book) = agent_book().await;

        let first = Envelope::parse("dst=scout&tag=store-info&agent=a1&counter=one").unwrap();
        let second = Envelope::parse("dst=scout&tag=store-info&agent=a1&counter=two").unwrap();
        book.store_info(&first).await.unwrap();
        book.store_info(&second).await.unwrap();

        let info = book.get_info("a1").await.unwrap().unwrap();
        assert!(info.contains("counter=one"));
    }

    #[tokio::test]
    async fn info_delete_consumes_the_blob() {
        let (_dir, book) = agent_book().await;

        let msg = Envelope::parse("dst=scout&tag=store-info&agent=a1").unwrap();
        book.store_info(&msg).await.unwrap();

        assert!(book.delete_info("a1").await.unwrap());
        assert!(!book.delete_info("a1").await.unwrap());
        assert_eq!(book.get_info("a1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn deferred_messages_keep_insertion_order() {
        let (_dir, book) = agent_book().await;

        for i in 0..5 {
            let raw = format!("dst=scout&tag=store-msg&_outpost_dst=a1&_outpost_tag=ping&seq={i}");
            book.store_message(&Envelope::parse(&raw).unwrap()).await.unwrap();
        }

        let messages = book.get_messages("a1").await.unwrap();
        assert_eq!(messages.len(), 5);
        for (i, raw) in messages.iter().enumerate() {
            let msg = Envelope::parse(raw).unwrap();
            assert_eq!(msg.dst(), Some("a1"));
            assert_eq!(msg.tags(), vec!["ping"]);
            assert_eq!(msg.get("seq"), Some(i.to_string().as_str()));
        }

        book.delete_messages("a1").await.unwrap();
        assert!(book.get_messages("a1").await.unwrap().is_empty());
    }
}
