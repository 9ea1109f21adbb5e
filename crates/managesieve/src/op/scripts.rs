/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use common::listener::{SessionResult, SessionStream};
use imap_proto::receiver::Request;
use sieve::Compiler;

use crate::{Command, Session, State};

impl<T: SessionStream> Session<T> {
    fn account_id(&self) -> Option<i64> {
        match &self.state {
            State::Authenticated { account } => Some(account.account_id),
            State::NotAuthenticated { .. } => None,
        }
    }

    fn compiler(&self) -> Compiler {
        Compiler::new()
            .with_max_script_size(self.core.config.managesieve.max_script_size)
    }

    pub async fn handle_listscripts(&mut self) -> SessionResult {
        let Some(account_id) = self.account_id() else {
            self.write_bytes(&crate::no("Not authenticated.")).await.ok();
            return SessionResult::Continue;
        };
        match self.core.store.list_sieve_scripts(account_id).await {
            Ok(scripts) => {
                let mut response = Vec::with_capacity(128);
                for script in scripts {
                    response.push(b'"');
                    response.extend_from_slice(script.name.as_bytes());
                    response.push(b'"');
                    if script.active {
                        response.extend_from_slice(b" ACTIVE");
                    }
                    response.extend_from_slice(b"\r\n");
                }
                response.extend(crate::ok("Listscripts completed."));
                self.write_bytes(&response).await.ok();
            }
            Err(_) => {
                self.write_bytes(&crate::no_code("TRYLATER", "Temporary server error."))
                    .await
                    .ok();
            }
        }
        SessionResult::Continue
    }

    pub async fn handle_getscript(&mut self, request: Request<Command>) -> SessionResult {
        let Some(account_id) = self.account_id() else {
            self.write_bytes(&crate::no("Not authenticated.")).await.ok();
            return SessionResult::Continue;
        };
        let Some(name) = string_arg(request, 0) else {
            self.write_bytes(&crate::no("Missing script name.")).await.ok();
            return SessionResult::Continue;
        };
        match self.core.store.sieve_script_by_name(account_id, &name).await {
            Ok(Some(script)) => {
                let mut response = Vec::with_capacity(script.script.len() + 32);
                response.push(b'{');
                response.extend_from_slice(script.script.len().to_string().as_bytes());
                response.extend_from_slice(b"}\r\n");
                response.extend_from_slice(script.script.as_bytes());
                response.extend_from_slice(b"\r\n");
                response.extend(crate::ok("Getscript completed."));
                self.write_bytes(&response).await.ok();
            }
            Ok(None) => {
                self.write_bytes(&crate::no_code("NONEXISTENT", "Script does not exist."))
                    .await
                    .ok();
            }
            Err(_) => {
                self.write_bytes(&crate::no_code("TRYLATER", "Temporary server error."))
                    .await
                    .ok();
            }
        }
        SessionResult::Continue
    }

    pub async fn handle_putscript(&mut self, request: Request<Command>) -> SessionResult {
        let Some(account_id) = self.account_id() else {
            self.write_bytes(&crate::no("Not authenticated.")).await.ok();
            return SessionResult::Continue;
        };
        let mut tokens = request.tokens.into_iter();
        let Some(name) = tokens.next().and_then(|token| token.unwrap_string().ok())
        else {
            self.write_bytes(&crate::no("Missing script name.")).await.ok();
            return SessionResult::Continue;
        };
        let Some(script) = tokens.next().map(|token| token.unwrap_bytes()) else {
            self.write_bytes(&crate::no("Missing script body.")).await.ok();
            return SessionResult::Continue;
        };
        if script.len() > self.core.config.managesieve.max_script_size {
            self.write_bytes(&crate::no_code("QUOTA/MAXSIZE", "Script is too large."))
                .await
                .ok();
            return SessionResult::Continue;
        }

        // Scripts are validated by compilation before they are stored.
        if let Err(err) = self.compiler().compile(&script) {
            self.write_bytes(&crate::no(&format!("Script error: {err}")))
                .await
                .ok();
            return SessionResult::Continue;
        }
        let script = match String::from_utf8(script) {
            Ok(script) => script,
            Err(_) => {
                self.write_bytes(&crate::no("Script is not valid UTF-8."))
                    .await
                    .ok();
                return SessionResult::Continue;
            }
        };

        match self
            .core
            .store
            .put_sieve_script(
                account_id,
                &name,
                &script,
                self.core.config.managesieve.max_scripts as i64,
            )
            .await
        {
            Ok(_) => {
                tracing::debug!(parent: &self.span, event = "putscript",
                    script = name, size = script.len(), "Sieve script stored.");
                self.write_bytes(&crate::ok("Putscript completed.")).await.ok();
            }
            Err(err) if matches!(err.kind, store::ErrorKind::QuotaExceeded) => {
                self.write_bytes(&crate::no_code("QUOTA/MAXSCRIPTS", "Too many scripts."))
                    .await
                    .ok();
            }
            Err(_) => {
                self.write_bytes(&crate::no_code("TRYLATER", "Temporary server error."))
                    .await
                    .ok();
            }
        }
        SessionResult::Continue
    }

    pub async fn handle_setactive(&mut self, request: Request<Command>) -> SessionResult {
        let Some(account_id) = self.account_id() else {
            self.write_bytes(&crate::no("Not authenticated.")).await.ok();
            return SessionResult::Continue;
        };
        // SETACTIVE "" deactivates all scripts.
        let name = string_arg(request, 0).unwrap_or_default();
        match self
            .core
            .store
            .set_active_sieve_script(account_id, &name)
            .await
        {
            Ok(()) => {
                self.write_bytes(&crate::ok("Setactive completed.")).await.ok();
            }
            Err(err) if err.is_not_found() => {
                self.write_bytes(&crate::no_code("NONEXISTENT", "Script does not exist."))
                    .await
                    .ok();
            }
            Err(_) => {
                self.write_bytes(&crate::no_code("TRYLATER", "Temporary server error."))
                    .await
                    .ok();
            }
        }
        SessionResult::Continue
    }

    pub async fn handle_deletescript(&mut self, request: Request<Command>) -> SessionResult {
        let Some(account_id) = self.account_id() else {
            self.write_bytes(&crate::no("Not authenticated.")).await.ok();
            return SessionResult::Continue;
        };
        let Some(name) = string_arg(request, 0) else {
            self.write_bytes(&crate::no("Missing script name.")).await.ok();
            return SessionResult::Continue;
        };
        match self.core.store.delete_sieve_script(account_id, &name).await {
            Ok(()) => {
                self.write_bytes(&crate::ok("Deletescript completed.")).await.ok();
            }
            Err(err) if err.is_not_found() => {
                self.write_bytes(&crate::no_code("NONEXISTENT", "Script does not exist."))
                    .await
                    .ok();
            }
            Err(err) if matches!(err.kind, store::ErrorKind::Forbidden) => {
                self.write_bytes(&crate::no_code("ACTIVE", "Cannot delete the active script."))
                    .await
                    .ok();
            }
            Err(_) => {
                self.write_bytes(&crate::no_code("TRYLATER", "Temporary server error."))
                    .await
                    .ok();
            }
        }
        SessionResult::Continue
    }

    pub async fn handle_renamescript(&mut self, request: Request<Command>) -> SessionResult {
        let Some(account_id) = self.account_id() else {
            self.write_bytes(&crate::no("Not authenticated.")).await.ok();
            return SessionResult::Continue;
        };
        let mut tokens = request.tokens.into_iter();
        let (Some(from), Some(to)) = (
            tokens.next().and_then(|token| token.unwrap_string().ok()),
            tokens.next().and_then(|token| token.unwrap_string().ok()),
        ) else {
            self.write_bytes(&crate::no("Missing script names.")).await.ok();
            return SessionResult::Continue;
        };
        match self
            .core
            .store
            .rename_sieve_script(account_id, &from, &to)
            .await
        {
            Ok(()) => {
                self.write_bytes(&crate::ok("Renamescript completed.")).await.ok();
            }
            Err(err) if err.is_not_found() => {
                self.write_bytes(&crate::no_code("NONEXISTENT", "Script does not exist."))
                    .await
                    .ok();
            }
            Err(err) if matches!(err.kind, store::ErrorKind::AlreadyExists) => {
                self.write_bytes(&crate::no_code(
                    "ALREADYEXISTS",
                    "A script with that name already exists.",
                ))
                .await
                .ok();
            }
            Err(_) => {
                self.write_bytes(&crate::no_code("TRYLATER", "Temporary server error."))
                    .await
                    .ok();
            }
        }
        SessionResult::Continue
    }

    pub async fn handle_checkscript(&mut self, request: Request<Command>) -> SessionResult {
        if self.account_id().is_none() {
            self.write_bytes(&crate::no("Not authenticated.")).await.ok();
            return SessionResult::Continue;
        }
        let Some(script) = request
            .tokens
            .into_iter()
            .next()
            .map(|token| token.unwrap_bytes())
        else {
            self.write_bytes(&crate::no("Missing script body.")).await.ok();
            return SessionResult::Continue;
        };
        match self.compiler().compile(&script) {
            Ok(_) => {
                self.write_bytes(&crate::ok("Script is valid.")).await.ok();
            }
            Err(err) => {
                self.write_bytes(&crate::no(&format!("Script error: {err}")))
                    .await
                    .ok();
            }
        }
        SessionResult::Continue
    }

    pub async fn handle_havespace(&mut self, request: Request<Command>) -> SessionResult {
        if self.account_id().is_none() {
            self.write_bytes(&crate::no("Not authenticated.")).await.ok();
            return SessionResult::Continue;
        }
        let mut tokens = request.tokens.into_iter();
        let _name = tokens.next();
        let size = tokens
            .next()
            .and_then(|token| token.unwrap_string().ok())
            .and_then(|size| size.parse::<usize>().ok());
        match size {
            Some(size) if size <= self.core.config.managesieve.max_script_size => {
                self.write_bytes(&crate::ok("Putscript would succeed.")).await.ok();
            }
            Some(_) => {
                self.write_bytes(&crate::no_code(
                    "QUOTA/MAXSIZE",
                    "Script size exceeds the limit.",
                ))
                .await
                .ok();
            }
            None => {
                self.write_bytes(&crate::no("Invalid arguments.")).await.ok();
            }
        }
        SessionResult::Continue
    }
}

fn string_arg(request: Request<Command>, index: usize) -> Option<String> {
    request
        .tokens
        .into_iter()
        .nth(index)
        .and_then(|token| token.unwrap_string().ok())
}
