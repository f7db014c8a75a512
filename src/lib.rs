// src/lib.rs
// Anweddol client
//
// Client half of the Anweddol protocol: negotiate an encrypted session with
// a server, issue CREATE / DESTROY / STAT requests and keep the returned
// credentials in local SQLite stores. The `commands` module ties the pieces
// together; everything below it is usable on its own.

pub mod client;
pub mod commands;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod keys;
pub mod sanitize;
pub mod web;
