use clap::{Parser, Subcommand};

/// Operational CLI surface of spec.md §6.
#[derive(Debug, Parser)]
#[command(name = "adam-collector", version, about = "ADAM-6051 counter acquisition service")]
pub struct Cli {
    /// Path to a TOML or JSON config file. Overrides `ADAM_CONFIG`.
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the acquisition service in the foreground until interrupted.
    Start,
    /// There is no background daemon or control channel to stop (spec.md
    /// §1 excludes HTTP/RPC fronts and persisted state); send SIGINT/SIGTERM
    /// to the running `start` process instead. This subcommand validates
    /// the config and reports that, so scripts calling it fail fast on a
    /// bad config rather than silently no-op'ing.
    Stop,
    /// Add a device to the config file. `path` points at a JSON/TOML
    /// fragment describing one device, matching `DeviceConfig`.
    AddDevice { path: String },
    /// Remove a device by id from the config file.
    RemoveDevice { id: String },
    /// Replace a device's config in the config file.
    UpdateDevice { path: String },
    /// Probe one device (or every configured device) and print its
    /// health. Since the core keeps no state across process restarts,
    /// this performs a fresh one-shot connectivity probe rather than
    /// querying a running instance.
    Health { id: Option<String> },
}
