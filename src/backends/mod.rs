// ABOUTME: Backend implementations (codex JSON-RPC, trae tool server, trae CLI fallback).
// ABOUTME: The facade in crate::bridge owns exactly one client of each.

pub mod codex;
pub mod trae;
pub mod trae_cli;
