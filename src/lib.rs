// minienv library
// Fixed-size pool of ephemeral development environments on Kubernetes.

// Bootstrap configuration and YAML templates
pub mod config;

// API error mapping
pub mod error;

// Session persistence (in-memory and Redis)
pub mod session;

// Auth provider interface and user store
pub mod auth;

// Thin Kubernetes REST client
pub mod k8s;

// Raw-content fetcher for repo metadata (env config, compose files)
pub mod repo;

// Environment lifecycle: planner, provisioner, pool, reconciler
pub mod env;

// REST API
pub mod api;
