//! Scenario-based tests for sitepipe

mod helpers;

mod binding;
mod build_failure;
mod idempotent_deploy;
mod invalidation;
mod retention;
mod success_chain;
mod supersede;
