/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sora", about = "Sora mail server", version)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value = "/etc/sora/config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the mail server.
    Serve,
    /// Create the database schema and exit.
    Migrate,
    /// Account administration.
    Account {
        #[command(subcommand)]
        command: AccountCommands,
    },
    /// Credential administration.
    Credential {
        #[command(subcommand)]
        command: CredentialCommands,
    },
    /// Local content cache operations.
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Import raw .eml files into a mailbox.
    Import {
        /// Primary address of the target account.
        address: String,
        /// Target mailbox name.
        #[arg(short, long, default_value = "INBOX")]
        mailbox: String,
        /// Directory containing .eml files.
        path: PathBuf,
    },
    /// Export an account's messages as .eml files.
    Export {
        /// Primary address of the account.
        address: String,
        /// Destination directory.
        path: PathBuf,
    },
}

#[derive(Subcommand)]
pub enum AccountCommands {
    /// Create an account with a primary credential.
    Create {
        address: String,
        password: String,
    },
    /// Soft-delete an account.
    Delete {
        address: String,
    },
    /// Restore a soft-deleted account.
    Restore {
        address: String,
    },
    /// List the credentials of an account.
    List {
        address: String,
    },
}

#[derive(Subcommand)]
pub enum CredentialCommands {
    /// Add a credential to an existing account.
    Add {
        /// Any existing address of the account.
        account_address: String,
        /// The new address.
        address: String,
        password: String,
    },
    /// Delete a credential.
    Delete {
        address: String,
    },
    /// List credentials for the account owning an address.
    List {
        address: String,
    },
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Print cache statistics.
    Stats,
    /// Remove every cached object.
    Purge,
}
