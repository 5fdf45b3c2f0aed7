pub mod config;
pub mod db;
pub mod engine;
pub mod metadata;
pub mod web;

#[cfg(test)]
mod integration_tests;
