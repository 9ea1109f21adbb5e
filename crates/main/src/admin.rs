/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::path::Path;

use common::{ingest::ParsedMessage, SharedCore};

use crate::cli::{AccountCommands, CacheCommands, CredentialCommands};

pub enum CommandError {
    User(String),
    Server(String),
    NotFound(String),
}

fn store_error(err: store::Error) -> CommandError {
    match err.kind {
        store::ErrorKind::NotFound => CommandError::NotFound(err.message.into_owned()),
        store::ErrorKind::AlreadyExists
        | store::ErrorKind::UniqueViolation
        | store::ErrorKind::Malformed
        | store::ErrorKind::Forbidden => CommandError::User(err.message.into_owned()),
        _ => CommandError::Server(err.message.into_owned()),
    }
}

fn hash_password(password: &str) -> Result<String, CommandError> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST)
        .map_err(|err| CommandError::Server(format!("Failed to hash password: {err}")))
}

async fn account_id_for(core: &SharedCore, address: &str) -> Result<i64, CommandError> {
    core.store
        .credential_by_address(address)
        .await
        .map_err(store_error)?
        .map(|credential| credential.account_id)
        .ok_or_else(|| CommandError::NotFound(format!("No account with address {address}")))
}

pub async fn account(core: &SharedCore, command: AccountCommands) -> Result<(), CommandError> {
    match command {
        AccountCommands::Create { address, password } => {
            let hash = hash_password(&password)?;
            let account = core
                .store
                .create_account(&address, &hash)
                .await
                .map_err(store_error)?;
            println!("Created account {} for {address}", account.id);
        }
        AccountCommands::Delete { address } => {
            let account_id = account_id_for(core, &address).await?;
            core.store
                .delete_account(account_id)
                .await
                .map_err(store_error)?;
            println!("Account {account_id} marked for deletion");
        }
        AccountCommands::Restore { address } => {
            // The credential lookup skips deleted accounts; go directly.
            let credential = core
                .store
                .pg()
                .credential_by_address_any(&address)
                .await
                .map_err(store_error)?
                .ok_or_else(|| {
                    CommandError::NotFound(format!("No account with address {address}"))
                })?;
            core.store
                .restore_account(credential.account_id)
                .await
                .map_err(store_error)?;
            println!("Account {} restored", credential.account_id);
        }
        AccountCommands::List { address } => {
            let account_id = account_id_for(core, &address).await?;
            for credential in core
                .store
                .list_credentials(account_id)
                .await
                .map_err(store_error)?
            {
                println!(
                    "{}\t{}",
                    credential.address,
                    if credential.is_primary { "primary" } else { "" }
                );
            }
        }
    }
    Ok(())
}

pub async fn credential(
    core: &SharedCore,
    command: CredentialCommands,
) -> Result<(), CommandError> {
    match command {
        CredentialCommands::Add {
            account_address,
            address,
            password,
        } => {
            let account_id = account_id_for(core, &account_address).await?;
            let hash = hash_password(&password)?;
            core.store
                .pg()
                .add_credential(account_id, &address, &hash)
                .await
                .map_err(store_error)?;
            println!("Added {address} to account {account_id}");
        }
        CredentialCommands::Delete { address } => {
            core.store
                .pg()
                .delete_credential(&address)
                .await
                .map_err(store_error)?;
            println!("Deleted {address}");
        }
        CredentialCommands::List { address } => {
            let account_id = account_id_for(core, &address).await?;
            for credential in core
                .store
                .list_credentials(account_id)
                .await
                .map_err(store_error)?
            {
                println!(
                    "{}\t{}",
                    credential.address,
                    if credential.is_primary { "primary" } else { "" }
                );
            }
        }
    }
    Ok(())
}

pub async fn cache(core: &SharedCore, command: CacheCommands) -> Result<(), CommandError> {
    match command {
        CacheCommands::Stats => {
            let stats = core.blob.cache.stats();
            println!(
                "objects: {}\nbytes: {}\nhits: {}\nmisses: {}",
                stats.objects, stats.total_bytes, stats.hits, stats.misses
            );
        }
        CacheCommands::Purge => {
            core.blob.cache.purge().await;
            println!("Cache purged");
        }
    }
    Ok(())
}

/// Imports a directory of .eml files through the regular ingest path so
/// dedupe, sort keys and pending uploads behave exactly as live mail.
pub async fn import(
    core: &SharedCore,
    address: &str,
    mailbox_name: &str,
    path: &Path,
) -> Result<(), CommandError> {
    let account_id = account_id_for(core, address).await?;
    let mailbox = match core
        .store
        .mailbox_by_name(account_id, mailbox_name, true)
        .await
        .map_err(store_error)?
    {
        Some(mailbox) => mailbox,
        None => core
            .store
            .create_mailbox(account_id, mailbox_name)
            .await
            .map_err(store_error)?,
    };

    let mut imported = 0u64;
    let mut entries = tokio::fs::read_dir(path)
        .await
        .map_err(|err| CommandError::User(format!("Cannot read {}: {err}", path.display())))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| CommandError::Server(err.to_string()))?
    {
        if entry.path().extension().and_then(|ext| ext.to_str()) != Some("eml") {
            continue;
        }
        let raw = tokio::fs::read(entry.path())
            .await
            .map_err(|err| CommandError::Server(err.to_string()))?;
        let Some(parsed) = ParsedMessage::parse(raw) else {
            eprintln!("Skipping unparsable {}", entry.path().display());
            continue;
        };
        let (message, raw) =
            parsed.into_new_message(account_id, &mailbox, 0, Vec::new(), None, None);
        let content_hash = message.content_hash.clone();
        let result = core
            .store
            .insert_message(&message)
            .await
            .map_err(store_error)?;
        if !result.duplicate {
            core.blob
                .staging
                .write(&content_hash, &raw)
                .await
                .map_err(store_error)?;
            imported += 1;
        }
    }
    println!("Imported {imported} messages into {mailbox_name}");
    Ok(())
}

pub async fn export(
    core: &SharedCore,
    address: &str,
    path: &Path,
) -> Result<(), CommandError> {
    let account_id = account_id_for(core, address).await?;
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|err| CommandError::User(format!("Cannot create {}: {err}", path.display())))?;

    let mut exported = 0u64;
    for mailbox in core
        .store
        .list_mailboxes(account_id, true)
        .await
        .map_err(store_error)?
    {
        let directory = path.join(mailbox.name.replace('/', "_"));
        tokio::fs::create_dir_all(&directory)
            .await
            .map_err(|err| CommandError::Server(err.to_string()))?;
        for message in core
            .store
            .messages_by_uids(mailbox.id, None, None, true)
            .await
            .map_err(store_error)?
        {
            let raw = match core.blob.get(&message.content_hash).await {
                Ok(raw) => raw,
                Err(err) => {
                    eprintln!("Skipping uid {}: {err}", message.uid);
                    continue;
                }
            };
            let file = directory.join(format!("{}.eml", message.uid));
            tokio::fs::write(&file, raw)
                .await
                .map_err(|err| CommandError::Server(err.to_string()))?;
            exported += 1;
        }
    }
    println!("Exported {exported} messages to {}", path.display());
    Ok(())
}
