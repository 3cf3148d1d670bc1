use chrono::{DateTime, Utc};
use fleet_common::{Lease, Machine, MachineConfig, MachineImageRef, MachineState, Volume};
use rusqlite::{params, Connection, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS machines (
    id TEXT PRIMARY KEY,
    app_id TEXT NOT NULL,
    name TEXT NOT NULL,
    instance_id TEXT NOT NULL,
    state TEXT NOT NULL,
    region TEXT NOT NULL,
    config TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS leases (
    machine_id TEXT PRIMARY KEY,
    nonce TEXT NOT NULL,
    owner TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    ttl_seconds INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS volumes (
    id TEXT PRIMARY KEY,
    app_id TEXT NOT NULL,
    name TEXT NOT NULL,
    region TEXT NOT NULL,
    size_gb INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
"#;

/// Initialize the database at the given path, creating the directory if needed.
pub fn init_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).ok();
    }

    let conn = Connection::open(path)?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// Fresh schema in memory, for tests and throwaway daemons.
pub fn init_memory_db() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// Get the default database path (~/.fleetd/fleet.db)
pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fleetd")
        .join("fleet.db")
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Load all machines. Rows whose config no longer parses are skipped.
pub fn load_machines(conn: &Connection) -> Result<Vec<Machine>> {
    let mut stmt = conn.prepare(
        "SELECT id, app_id, name, instance_id, state, region, config, created_at, updated_at FROM machines",
    )?;

    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, String>(6)?,
            row.get::<_, String>(7)?,
            row.get::<_, String>(8)?,
        ))
    })?;

    let mut machines = Vec::new();
    for row in rows {
        let (id, app_id, name, instance_id, state, region, config, created_at, updated_at) = row?;
        let config: MachineConfig = match serde_json::from_str(&config) {
            Ok(config) => config,
            Err(e) => {
                warn!(machine_id = %id, error = %e, "skipping machine with unreadable config");
                continue;
            }
        };
        let state = state.parse().unwrap_or(MachineState::Stopped);
        machines.push(Machine {
            image_ref: MachineImageRef::parse(&config.image),
            id,
            name,
            app_id,
            instance_id,
            state,
            region,
            config,
            created_at: parse_time(&created_at),
            updated_at: parse_time(&updated_at),
            lease: None,
        });
    }
    Ok(machines)
}

/// Save a machine, replacing any previous row.
pub fn save_machine(conn: &Connection, machine: &Machine) -> Result<()> {
    let config = serde_json::to_string(&machine.config)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

    conn.execute(
        "INSERT OR REPLACE INTO machines (id, app_id, name, instance_id, state, region, config, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            machine.id,
            machine.app_id,
            machine.name,
            machine.instance_id,
            machine.state.as_str(),
            machine.region,
            config,
            machine.created_at.to_rfc3339(),
            machine.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn load_leases(conn: &Connection) -> Result<Vec<Lease>> {
    let mut stmt =
        conn.prepare("SELECT machine_id, nonce, owner, expires_at, ttl_seconds FROM leases")?;

    let lease_iter = stmt.query_map([], |row| {
        let expires_at: String = row.get(3)?;
        Ok(Lease {
            machine_id: row.get(0)?,
            nonce: row.get(1)?,
            owner: row.get(2)?,
            expires_at: parse_time(&expires_at),
            ttl_seconds: row.get(4)?,
        })
    })?;

    let leases = lease_iter.collect::<Result<Vec<_>>>()?;
    Ok(leases)
}

/// Save a lease to the database.
pub fn save_lease(conn: &Connection, lease: &Lease) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO leases (machine_id, nonce, owner, expires_at, ttl_seconds) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            lease.machine_id,
            lease.nonce,
            lease.owner,
            lease.expires_at.to_rfc3339(),
            lease.ttl_seconds,
        ],
    )?;
    Ok(())
}

/// Delete a lease from the database.
pub fn delete_lease(conn: &Connection, machine_id: &str) -> Result<bool> {
    let rows = conn.execute("DELETE FROM leases WHERE machine_id = ?1", params![machine_id])?;
    Ok(rows > 0)
}

/// Delete all expired leases from the database.
pub fn delete_expired(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<String>> {
    let expired: Vec<String> = load_leases(conn)?
        .into_iter()
        .filter(|lease| !lease.is_valid_at(now))
        .map(|lease| lease.machine_id)
        .collect();

    for machine_id in &expired {
        delete_lease(conn, machine_id)?;
    }

    Ok(expired)
}

pub fn load_volumes(conn: &Connection) -> Result<Vec<Volume>> {
    let mut stmt =
        conn.prepare("SELECT id, app_id, name, region, size_gb, created_at FROM volumes")?;

    let volume_iter = stmt.query_map([], |row| {
        let created_at: String = row.get(5)?;
        Ok(Volume {
            id: row.get(0)?,
            app_id: row.get(1)?,
            name: row.get(2)?,
            region: row.get(3)?,
            size_gb: row.get(4)?,
            created_at: parse_time(&created_at),
        })
    })?;

    let volumes = volume_iter.collect::<Result<Vec<_>>>()?;
    Ok(volumes)
}

pub fn save_volume(conn: &Connection, volume: &Volume) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO volumes (id, app_id, name, region, size_gb, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            volume.id,
            volume.app_id,
            volume.name,
            volume.region,
            volume.size_gb,
            volume.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}
