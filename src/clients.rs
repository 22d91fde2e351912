//! Client registry

use crate::context::Context;
use crate::error::{AppError, AppResult};
use crate::models::Client;
use crate::store::{CLIENT_CODE_SEQUENCE, Collection, now_rfc3339};

const SEARCH_LIMIT: usize = 5;

/// `C` followed by the zero-padded sequence value
pub fn format_code(value: u64) -> String {
    format!("C{value:05}")
}

#[derive(Clone)]
pub struct ClientRegistry {
    ctx: Context,
}

impl ClientRegistry {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    pub fn list(&self) -> AppResult<Vec<Client>> {
        let mut clients: Vec<Client> = self.ctx.load(Collection::Clients)?;
        clients.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(clients)
    }

    pub fn get(&self, id: &str) -> AppResult<Client> {
        self.ctx
            .find(Collection::Clients, id)?
            .ok_or_else(|| AppError::not_found("Cliente", id))
    }

    pub fn create(&self, input: Client) -> AppResult<Client> {
        validate(&input)?;
        let _guard = self.ctx.write()?;

        let now = now_rfc3339();
        let code = format_code(self.ctx.store.next_sequence(CLIENT_CODE_SEQUENCE)?);
        let client = Client {
            id: uuid::Uuid::new_v4().to_string(),
            code,
            created_at: now.clone(),
            updated_at: now,
            ..input
        };

        self.ctx.save_record(Collection::Clients, &client)?;
        tracing::info!(client_id = %client.id, code = %client.code, "Client created");
        Ok(client)
    }

    /// Replaces the editable fields; id, code and creation time are kept
    pub fn update(&self, id: &str, input: Client) -> AppResult<Client> {
        validate(&input)?;
        let _guard = self.ctx.write()?;

        let existing = self.get(id)?;
        let client = Client {
            id: existing.id,
            code: existing.code,
            created_at: existing.created_at,
            updated_at: now_rfc3339(),
            ..input
        };

        self.ctx.save_record(Collection::Clients, &client)?;
        Ok(client)
    }

    pub fn delete(&self, id: &str) -> AppResult<()> {
        let _guard = self.ctx.write()?;
        if !self.ctx.delete_record::<Client>(Collection::Clients, id)? {
            return Err(AppError::not_found("Cliente", id));
        }
        tracing::info!(client_id = %id, "Client deleted");
        Ok(())
    }

    /// Case-insensitive prefix match on name or code
    pub fn search(&self, term: &str) -> AppResult<Vec<Client>> {
        let term = term.trim().to_lowercase();
        if term.is_empty() {
            return Ok(Vec::new());
        }

        let mut matches: Vec<Client> = self
            .list()?
            .into_iter()
            .filter(|c| {
                c.name.to_lowercase().starts_with(&term) || c.code.to_lowercase().starts_with(&term)
            })
            .collect();
        matches.sort_by(|a, b| a.name.cmp(&b.name));
        matches.truncate(SEARCH_LIMIT);
        Ok(matches)
    }
}

fn validate(input: &Client) -> AppResult<()> {
    if input.name.trim().is_empty() {
        return Err(AppError::Validation("Informe o nome do cliente".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;

    fn named(name: &str) -> Client {
        Client {
            name: name.to_string(),
            phone: "13 99999-0000".into(),
            ..Default::default()
        }
    }

    #[test]
    fn codes_come_from_a_monotonic_counter() {
        let registry = ClientRegistry::new(test_context());
        let a = registry.create(named("Padaria Central")).unwrap();
        let b = registry.create(named("Mercado Sul")).unwrap();
        assert_eq!(a.code, "C00001");
        assert_eq!(b.code, "C00002");

        // Deleting the newest client never re-issues its code
        registry.delete(&b.id).unwrap();
        let c = registry.create(named("Hotel Mar")).unwrap();
        assert_eq!(c.code, "C00003");
    }

    #[test]
    fn update_keeps_identity_and_code() {
        let registry = ClientRegistry::new(test_context());
        let created = registry.create(named("Padaria Central")).unwrap();

        let updated = registry
            .update(
                &created.id,
                Client {
                    id: "ignored".into(),
                    code: "C99999".into(),
                    ..named("Padaria Central Ltda")
                },
            )
            .unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.code, created.code);
        assert_eq!(registry.get(&created.id).unwrap().name, "Padaria Central Ltda");
    }

    #[test]
    fn blank_name_is_rejected() {
        let registry = ClientRegistry::new(test_context());
        assert!(matches!(
            registry.create(named("  ")),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn search_matches_name_or_code_prefix() {
        let registry = ClientRegistry::new(test_context());
        registry.create(named("Padaria Central")).unwrap();
        registry.create(named("padaria Norte")).unwrap();
        registry.create(named("Mercado")).unwrap();

        assert_eq!(registry.search("PADA").unwrap().len(), 2);
        assert_eq!(registry.search("c00003").unwrap()[0].name, "Mercado");
        assert!(registry.search("  ").unwrap().is_empty());
    }

    #[test]
    fn mutations_reach_the_outbox() {
        let ctx = test_context();
        let registry = ClientRegistry::new(ctx.clone());
        let client = registry.create(named("Padaria")).unwrap();
        assert!(ctx.store.pending_record_ids("clients").unwrap().contains(&client.id));

        assert!(matches!(
            registry.delete("missing"),
            Err(AppError::NotFound { .. })
        ));
    }
}
