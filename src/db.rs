// src/db.rs
// SQLite-backed stores for access tokens, session and container credentials
//
// One file and one table per store. Tables are created on open and the
// database file is created recursively if missing. Entries are immutable:
// they are added after a successful CREATE and deleted on DESTROY.

use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{ClientError, Result};

/// `(entry_id, created_at, server_ip)` triple returned by `list_entries`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySummary {
    pub entry_id: i64,
    pub created_at: i64,
    pub server_ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessTokenEntry {
    pub entry_id: i64,
    pub created_at: i64,
    pub server_ip: String,
    pub server_port: u16,
    pub access_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCredentialsEntry {
    pub entry_id: i64,
    pub created_at: i64,
    pub server_ip: String,
    pub server_port: u16,
    pub container_uuid: String,
    pub client_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerCredentialsEntry {
    pub entry_id: i64,
    pub created_at: i64,
    pub server_ip: String,
    pub server_port: u16,
    pub container_username: String,
    pub container_password: String,
    pub container_listen_port: u16,
}

fn open_database(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| ClientError::Store(e.to_string()))?;
        }
    }

    Ok(Connection::open(path)?)
}

fn list_query(conn: &Connection, table: &str) -> Result<Vec<EntrySummary>> {
    let sql = format!(
        "SELECT EntryID, CreationTimestamp, ServerIP FROM {} ORDER BY EntryID",
        table
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(EntrySummary {
                entry_id: row.get(0)?,
                created_at: row.get(1)?,
                server_ip: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

// ============ ACCESS TOKEN STORE ============

pub struct AccessTokenStore {
    conn: Option<Connection>,
}

impl AccessTokenStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = open_database(path.as_ref())?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS AnweddolClientAccessTokenTable (
                EntryID INTEGER NOT NULL PRIMARY KEY,
                CreationTimestamp INTEGER NOT NULL,
                ServerIP TEXT NOT NULL,
                ServerPort INTEGER NOT NULL,
                AccessToken TEXT NOT NULL
            )",
            [],
        )?;

        Ok(AccessTokenStore { conn: Some(conn) })
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| ClientError::Store("store is closed".into()))
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    /// First matching entry id for a server IP, if any.
    pub fn get_entry_id(&self, server_ip: &str) -> Result<Option<i64>> {
        Ok(self
            .conn()?
            .query_row(
                "SELECT EntryID FROM AnweddolClientAccessTokenTable WHERE ServerIP=?1",
                params![server_ip],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn get_entry(&self, entry_id: i64) -> Result<Option<AccessTokenEntry>> {
        Ok(self
            .conn()?
            .query_row(
                "SELECT EntryID, CreationTimestamp, ServerIP, ServerPort, AccessToken
                 FROM AnweddolClientAccessTokenTable WHERE EntryID=?1",
                params![entry_id],
                |row| {
                    Ok(AccessTokenEntry {
                        entry_id: row.get(0)?,
                        created_at: row.get(1)?,
                        server_ip: row.get(2)?,
                        server_port: row.get(3)?,
                        access_token: row.get(4)?,
                    })
                },
            )
            .optional()?)
    }

    /// Insert a new token row. Duplicate-IP policing is the caller's job.
    pub fn add_entry(
        &self,
        server_ip: &str,
        server_port: u16,
        access_token: &str,
    ) -> Result<(i64, i64)> {
        let created_at = Utc::now().timestamp();
        let conn = self.conn()?;

        conn.execute(
            "INSERT INTO AnweddolClientAccessTokenTable
                (CreationTimestamp, ServerIP, ServerPort, AccessToken)
             VALUES (?1, ?2, ?3, ?4)",
            params![created_at, server_ip, server_port, access_token],
        )?;

        Ok((conn.last_insert_rowid(), created_at))
    }

    pub fn list_entries(&self) -> Result<Vec<EntrySummary>> {
        list_query(self.conn()?, "AnweddolClientAccessTokenTable")
    }

    pub fn delete_entry(&self, entry_id: i64) -> Result<()> {
        self.conn()?.execute(
            "DELETE FROM AnweddolClientAccessTokenTable WHERE EntryID=?1",
            params![entry_id],
        )?;
        Ok(())
    }

    /// Idempotent: calling on an already closed store is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close()
                .map_err(|(_, err)| ClientError::Store(err.to_string()))?;
        }
        Ok(())
    }
}

// ============ SESSION CREDENTIALS STORE ============

pub struct SessionCredentialsStore {
    conn: Option<Connection>,
}

impl SessionCredentialsStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = open_database(path.as_ref())?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS AnweddolClientSessionCredentialsTable (
                EntryID INTEGER NOT NULL PRIMARY KEY,
                CreationTimestamp INTEGER NOT NULL,
                ServerIP TEXT NOT NULL,
                ServerPort INTEGER NOT NULL,
                ContainerUUID TEXT NOT NULL,
                ClientToken TEXT NOT NULL
            )",
            [],
        )?;

        Ok(SessionCredentialsStore { conn: Some(conn) })
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| ClientError::Store("store is closed".into()))
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    pub fn get_entry_id(&self, server_ip: &str) -> Result<Option<i64>> {
        Ok(self
            .conn()?
            .query_row(
                "SELECT EntryID FROM AnweddolClientSessionCredentialsTable WHERE ServerIP=?1",
                params![server_ip],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn get_entry(&self, entry_id: i64) -> Result<Option<SessionCredentialsEntry>> {
        Ok(self
            .conn()?
            .query_row(
                "SELECT EntryID, CreationTimestamp, ServerIP, ServerPort, ContainerUUID, ClientToken
                 FROM AnweddolClientSessionCredentialsTable WHERE EntryID=?1",
                params![entry_id],
                |row| {
                    Ok(SessionCredentialsEntry {
                        entry_id: row.get(0)?,
                        created_at: row.get(1)?,
                        server_ip: row.get(2)?,
                        server_port: row.get(3)?,
                        container_uuid: row.get(4)?,
                        client_token: row.get(5)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn add_entry(
        &self,
        server_ip: &str,
        server_port: u16,
        container_uuid: &str,
        client_token: &str,
    ) -> Result<(i64, i64)> {
        let created_at = Utc::now().timestamp();
        let conn = self.conn()?;

        conn.execute(
            "INSERT INTO AnweddolClientSessionCredentialsTable
                (CreationTimestamp, ServerIP, ServerPort, ContainerUUID, ClientToken)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![created_at, server_ip, server_port, container_uuid, client_token],
        )?;

        Ok((conn.last_insert_rowid(), created_at))
    }

    pub fn list_entries(&self) -> Result<Vec<EntrySummary>> {
        list_query(self.conn()?, "AnweddolClientSessionCredentialsTable")
    }

    pub fn delete_entry(&self, entry_id: i64) -> Result<()> {
        self.conn()?.execute(
            "DELETE FROM AnweddolClientSessionCredentialsTable WHERE EntryID=?1",
            params![entry_id],
        )?;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close()
                .map_err(|(_, err)| ClientError::Store(err.to_string()))?;
        }
        Ok(())
    }
}

// ============ CONTAINER CREDENTIALS STORE ============

pub struct ContainerCredentialsStore {
    conn: Option<Connection>,
}

impl ContainerCredentialsStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = open_database(path.as_ref())?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS AnweddolClientContainerCredentialsTable (
                EntryID INTEGER NOT NULL PRIMARY KEY,
                CreationTimestamp INTEGER NOT NULL,
                ServerIP TEXT NOT NULL,
                ServerPort INTEGER NOT NULL,
                ContainerUsername TEXT NOT NULL,
                ContainerPassword TEXT NOT NULL,
                ContainerListenPort INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(ContainerCredentialsStore { conn: Some(conn) })
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| ClientError::Store("store is closed".into()))
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    pub fn get_entry_id(&self, server_ip: &str) -> Result<Option<i64>> {
        Ok(self
            .conn()?
            .query_row(
                "SELECT EntryID FROM AnweddolClientContainerCredentialsTable WHERE ServerIP=?1",
                params![server_ip],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn get_entry(&self, entry_id: i64) -> Result<Option<ContainerCredentialsEntry>> {
        Ok(self
            .conn()?
            .query_row(
                "SELECT EntryID, CreationTimestamp, ServerIP, ServerPort,
                        ContainerUsername, ContainerPassword, ContainerListenPort
                 FROM AnweddolClientContainerCredentialsTable WHERE EntryID=?1",
                params![entry_id],
                |row| {
                    Ok(ContainerCredentialsEntry {
                        entry_id: row.get(0)?,
                        created_at: row.get(1)?,
                        server_ip: row.get(2)?,
                        server_port: row.get(3)?,
                        container_username: row.get(4)?,
                        container_password: row.get(5)?,
                        container_listen_port: row.get(6)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn add_entry(
        &self,
        server_ip: &str,
        server_port: u16,
        container_username: &str,
        container_password: &str,
        container_listen_port: u16,
    ) -> Result<(i64, i64)> {
        let created_at = Utc::now().timestamp();
        let conn = self.conn()?;

        conn.execute(
            "INSERT INTO AnweddolClientContainerCredentialsTable
                (CreationTimestamp, ServerIP, ServerPort,
                 ContainerUsername, ContainerPassword, ContainerListenPort)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                created_at,
                server_ip,
                server_port,
                container_username,
                container_password,
                container_listen_port
            ],
        )?;

        Ok((conn.last_insert_rowid(), created_at))
    }

    pub fn list_entries(&self) -> Result<Vec<EntrySummary>> {
        list_query(self.conn()?, "AnweddolClientContainerCredentialsTable")
    }

    pub fn delete_entry(&self, entry_id: i64) -> Result<()> {
        self.conn()?.execute(
            "DELETE FROM AnweddolClientContainerCredentialsTable WHERE EntryID=?1",
            params![entry_id],
        )?;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close()
                .map_err(|(_, err)| ClientError::Store(err.to_string()))?;
        }
        Ok(())
    }
}

// ============ SCOPED ACQUISITION ============
//
// Stores are opened per operation. These helpers guarantee the handle is
// released on every exit path; a close failure never masks the operation's
// own error.

pub fn with_token_store<T>(
    path: impl AsRef<Path>,
    f: impl FnOnce(&AccessTokenStore) -> Result<T>,
) -> Result<T> {
    let mut store = AccessTokenStore::open(path)?;
    match f(&store) {
        Ok(value) => {
            store.close()?;
            Ok(value)
        }
        Err(err) => {
            let _ = store.close();
            Err(err)
        }
    }
}

pub fn with_session_store<T>(
    path: impl AsRef<Path>,
    f: impl FnOnce(&SessionCredentialsStore) -> Result<T>,
) -> Result<T> {
    let mut store = SessionCredentialsStore::open(path)?;
    match f(&store) {
        Ok(value) => {
            store.close()?;
            Ok(value)
        }
        Err(err) => {
            let _ = store.close();
            Err(err)
        }
    }
}

pub fn with_container_store<T>(
    path: impl AsRef<Path>,
    f: impl FnOnce(&ContainerCredentialsStore) -> Result<T>,
) -> Result<T> {
    let mut store = ContainerCredentialsStore::open(path)?;
    match f(&store) {
        Ok(value) => {
            store.close()?;
            Ok(value)
        }
        Err(err) => {
            let _ = store.close();
            Err(err)
        }
    }
}
