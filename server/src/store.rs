//! Local persistence: assistant mirrors, customers, thread index and admin
//! sessions. `PgStore` is the production backend; `MemoryStore` backs
//! development runs without a database and the test suite.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{postgres::PgRow, PgPool, Row};
use tokio::sync::RwLock;

use crate::types::{
    AdminSession, Assistant, ConversationThread, Customer, SyncStatus, ThreadSummary,
};

#[async_trait]
pub trait Store: Send + Sync {
    /// Newest first.
    async fn list_assistants(&self) -> Result<Vec<Assistant>, sqlx::Error>;
    async fn list_assistants_with_status(
        &self,
        status: SyncStatus,
    ) -> Result<Vec<Assistant>, sqlx::Error>;
    async fn get_assistant(&self, id: &str) -> Result<Option<Assistant>, sqlx::Error>;
    async fn insert_assistant(&self, assistant: &Assistant) -> Result<(), sqlx::Error>;
    /// Full replacement of every column except `created_at`.
    async fn update_assistant(&self, assistant: &Assistant) -> Result<(), sqlx::Error>;
    async fn set_assistant_status(
        &self,
        id: &str,
        status: SyncStatus,
        updated_at: &str,
    ) -> Result<bool, sqlx::Error>;
    async fn delete_assistant(&self, id: &str) -> Result<bool, sqlx::Error>;

    /// Oldest customer whose email or phone matches.
    async fn find_customer(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Option<Customer>, sqlx::Error>;
    async fn insert_customer(&self, customer: &Customer) -> Result<(), sqlx::Error>;
    async fn update_customer_contact(
        &self,
        id: &str,
        name: &str,
        phone: Option<&str>,
        updated_at: &str,
    ) -> Result<(), sqlx::Error>;

    async fn get_thread(&self, id: &str) -> Result<Option<ConversationThread>, sqlx::Error>;
    async fn latest_thread(
        &self,
        customer_id: &str,
        assistant_id: &str,
    ) -> Result<Option<ConversationThread>, sqlx::Error>;
    async fn insert_thread(&self, thread: &ConversationThread) -> Result<(), sqlx::Error>;
    /// Newest first, joined with the owning customer.
    async fn list_threads(&self) -> Result<Vec<ThreadSummary>, sqlx::Error>;
    async fn get_customer(&self, id: &str) -> Result<Option<Customer>, sqlx::Error>;

    async fn insert_admin_session(&self, session: &AdminSession) -> Result<(), sqlx::Error>;
    /// Only sessions that have not expired at `now`.
    async fn find_admin_session(
        &self,
        token_hash: &str,
        now: &str,
    ) -> Result<Option<AdminSession>, sqlx::Error>;
    async fn delete_admin_session(&self, token_hash: &str) -> Result<(), sqlx::Error>;
    /// Removes sessions that expired at or before `now`; returns how many.
    async fn purge_expired_admin_sessions(&self, now: &str) -> Result<u64, sqlx::Error>;
}

fn json_text<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

fn parse_string_list(value: &str) -> Vec<String> {
    serde_json::from_str(value).unwrap_or_default()
}

pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

const ASSISTANT_COLUMNS: &str = "id, name, instructions, model, tools, temperature, top_p, \
     response_format, file_ids, vector_store_id, sync_status, created_at, updated_at";

fn assistant_from_row(row: &PgRow) -> Assistant {
    let status: String = row.get("sync_status");
    Assistant {
        id: row.get("id"),
        name: row.get("name"),
        instructions: row.get("instructions"),
        model: row.get("model"),
        tools: parse_string_list(&row.get::<String, _>("tools")),
        temperature: row.get("temperature"),
        top_p: row.get("top_p"),
        response_format: serde_json::from_str(&row.get::<String, _>("response_format"))
            .unwrap_or(Value::Null),
        file_ids: parse_string_list(&row.get::<String, _>("file_ids")),
        vector_store_id: row.get("vector_store_id"),
        sync_status: SyncStatus::parse(&status).unwrap_or(SyncStatus::Pending),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn customer_from_row(row: &PgRow) -> Customer {
    Customer {
        id: row.get("id"),
        name: row.get("name"),
        email: row.get("email"),
        phone: row.get("phone"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn thread_from_row(row: &PgRow) -> ConversationThread {
    ConversationThread {
        id: row.get("id"),
        provider_thread_id: row.get("provider_thread_id"),
        customer_id: row.get("customer_id"),
        assistant_id: row.get("assistant_id"),
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl Store for PgStore {
    async fn list_assistants(&self) -> Result<Vec<Assistant>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            "SELECT {ASSISTANT_COLUMNS} FROM assistants ORDER BY created_at DESC"
        ))
        .fetch_all(&self.db)
        .await?;
        Ok(rows.iter().map(assistant_from_row).collect())
    }

    async fn list_assistants_with_status(
        &self,
        status: SyncStatus,
    ) -> Result<Vec<Assistant>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            "SELECT {ASSISTANT_COLUMNS} FROM assistants WHERE sync_status = $1 ORDER BY created_at ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.db)
        .await?;
        Ok(rows.iter().map(assistant_from_row).collect())
    }

    async fn get_assistant(&self, id: &str) -> Result<Option<Assistant>, sqlx::Error> {
        let row = sqlx::query(&format!(
            "SELECT {ASSISTANT_COLUMNS} FROM assistants WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.as_ref().map(assistant_from_row))
    }

    async fn insert_assistant(&self, assistant: &Assistant) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO assistants (id, name, instructions, model, tools, temperature, top_p, \
             response_format, file_ids, vector_store_id, sync_status, created_at, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)",
        )
        .bind(&assistant.id)
        .bind(&assistant.name)
        .bind(&assistant.instructions)
        .bind(&assistant.model)
        .bind(json_text(&assistant.tools))
        .bind(assistant.temperature)
        .bind(assistant.top_p)
        .bind(json_text(&assistant.response_format))
        .bind(json_text(&assistant.file_ids))
        .bind(&assistant.vector_store_id)
        .bind(assistant.sync_status.as_str())
        .bind(&assistant.created_at)
        .bind(&assistant.updated_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn update_assistant(&self, assistant: &Assistant) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE assistants SET name = $1, instructions = $2, model = $3, tools = $4, \
             temperature = $5, top_p = $6, response_format = $7, file_ids = $8, \
             vector_store_id = $9, sync_status = $10, updated_at = $11 WHERE id = $12",
        )
        .bind(&assistant.name)
        .bind(&assistant.instructions)
        .bind(&assistant.model)
        .bind(json_text(&assistant.tools))
        .bind(assistant.temperature)
        .bind(assistant.top_p)
        .bind(json_text(&assistant.response_format))
        .bind(json_text(&assistant.file_ids))
        .bind(&assistant.vector_store_id)
        .bind(assistant.sync_status.as_str())
        .bind(&assistant.updated_at)
        .bind(&assistant.id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn set_assistant_status(
        &self,
        id: &str,
        status: SyncStatus,
        updated_at: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE assistants SET sync_status = $1, updated_at = $2 WHERE id = $3")
            .bind(status.as_str())
            .bind(updated_at)
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_assistant(&self, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM assistants WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_customer(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Option<Customer>, sqlx::Error> {
        if email.is_none() && phone.is_none() {
            return Ok(None);
        }
        let row = sqlx::query(
            "SELECT id, name, email, phone, created_at, updated_at FROM customers \
             WHERE ($1::TEXT IS NOT NULL AND email = $1) OR ($2::TEXT IS NOT NULL AND phone = $2) \
             ORDER BY created_at ASC LIMIT 1",
        )
        .bind(email)
        .bind(phone)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.as_ref().map(customer_from_row))
    }

    async fn insert_customer(&self, customer: &Customer) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO customers (id, name, email, phone, created_at, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6)",
        )
        .bind(&customer.id)
        .bind(&customer.name)
        .bind(&customer.email)
        .bind(&customer.phone)
        .bind(&customer.created_at)
        .bind(&customer.updated_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn update_customer_contact(
        &self,
        id: &str,
        name: &str,
        phone: Option<&str>,
        updated_at: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE customers SET name = $1, phone = $2, updated_at = $3 WHERE id = $4")
            .bind(name)
            .bind(phone)
            .bind(updated_at)
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn get_customer(&self, id: &str) -> Result<Option<Customer>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, name, email, phone, created_at, updated_at FROM customers WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.as_ref().map(customer_from_row))
    }

    async fn get_thread(&self, id: &str) -> Result<Option<ConversationThread>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, provider_thread_id, customer_id, assistant_id, created_at \
             FROM threads WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.as_ref().map(thread_from_row))
    }

    async fn latest_thread(
        &self,
        customer_id: &str,
        assistant_id: &str,
    ) -> Result<Option<ConversationThread>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, provider_thread_id, customer_id, assistant_id, created_at \
             FROM threads WHERE customer_id = $1 AND assistant_id = $2 \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(customer_id)
        .bind(assistant_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.as_ref().map(thread_from_row))
    }

    async fn insert_thread(&self, thread: &ConversationThread) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO threads (id, provider_thread_id, customer_id, assistant_id, created_at) \
             VALUES ($1,$2,$3,$4,$5)",
        )
        .bind(&thread.id)
        .bind(&thread.provider_thread_id)
        .bind(&thread.customer_id)
        .bind(&thread.assistant_id)
        .bind(&thread.created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn list_threads(&self) -> Result<Vec<ThreadSummary>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT t.id, t.provider_thread_id, t.assistant_id, t.created_at, \
             c.id AS customer_id, c.name, c.email, c.phone, \
             c.created_at AS customer_created_at, c.updated_at AS customer_updated_at \
             FROM threads t \
             JOIN customers c ON c.id = t.customer_id \
             ORDER BY t.created_at DESC",
        )
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ThreadSummary {
                id: row.get("id"),
                provider_thread_id: row.get("provider_thread_id"),
                assistant_id: row.get("assistant_id"),
                created_at: row.get("created_at"),
                customer: Customer {
                    id: row.get("customer_id"),
                    name: row.get("name"),
                    email: row.get("email"),
                    phone: row.get("phone"),
                    created_at: row.get("customer_created_at"),
                    updated_at: row.get("customer_updated_at"),
                },
            })
            .collect())
    }

    async fn insert_admin_session(&self, session: &AdminSession) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO admin_sessions (token_hash, created_at, expires_at) VALUES ($1,$2,$3)",
        )
        .bind(&session.token_hash)
        .bind(&session.created_at)
        .bind(&session.expires_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn find_admin_session(
        &self,
        token_hash: &str,
        now: &str,
    ) -> Result<Option<AdminSession>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT token_hash, created_at, expires_at FROM admin_sessions \
             WHERE token_hash = $1 AND expires_at > $2",
        )
        .bind(token_hash)
        .bind(now)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|row| AdminSession {
            token_hash: row.get("token_hash"),
            created_at: row.get("created_at"),
            expires_at: row.get("expires_at"),
        }))
    }

    async fn delete_admin_session(&self, token_hash: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM admin_sessions WHERE token_hash = $1")
            .bind(token_hash)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn purge_expired_admin_sessions(&self, now: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM admin_sessions WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Default)]
struct MemoryTables {
    assistants: HashMap<String, Assistant>,
    customers: Vec<Customer>,
    threads: Vec<ConversationThread>,
    admin_sessions: HashMap<String, AdminSession>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<MemoryTables>,
    #[cfg(test)]
    pub fail_assistant_writes: std::sync::atomic::AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn check_assistant_write(&self) -> Result<(), sqlx::Error> {
        if self
            .fail_assistant_writes
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            return Err(sqlx::Error::Protocol("injected write failure".to_string()));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn check_assistant_write(&self) -> Result<(), sqlx::Error> {
        Ok(())
    }

    #[cfg(test)]
    pub async fn customer_count(&self) -> usize {
        self.tables.read().await.customers.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_assistants(&self) -> Result<Vec<Assistant>, sqlx::Error> {
        let tables = self.tables.read().await;
        let mut assistants: Vec<Assistant> = tables.assistants.values().cloned().collect();
        assistants.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(assistants)
    }

    async fn list_assistants_with_status(
        &self,
        status: SyncStatus,
    ) -> Result<Vec<Assistant>, sqlx::Error> {
        let tables = self.tables.read().await;
        let mut assistants: Vec<Assistant> = tables
            .assistants
            .values()
            .filter(|assistant| assistant.sync_status == status)
            .cloned()
            .collect();
        assistants.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(assistants)
    }

    async fn get_assistant(&self, id: &str) -> Result<Option<Assistant>, sqlx::Error> {
        Ok(self.tables.read().await.assistants.get(id).cloned())
    }

    async fn insert_assistant(&self, assistant: &Assistant) -> Result<(), sqlx::Error> {
        self.check_assistant_write()?;
        let mut tables = self.tables.write().await;
        if tables.assistants.contains_key(&assistant.id) {
            return Err(sqlx::Error::Protocol(format!(
                "duplicate assistant id {}",
                assistant.id
            )));
        }
        tables
            .assistants
            .insert(assistant.id.clone(), assistant.clone());
        Ok(())
    }

    async fn update_assistant(&self, assistant: &Assistant) -> Result<(), sqlx::Error> {
        self.check_assistant_write()?;
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.assistants.get_mut(&assistant.id) {
            let created_at = existing.created_at.clone();
            *existing = Assistant {
                created_at,
                ..assistant.clone()
            };
        }
        Ok(())
    }

    async fn set_assistant_status(
        &self,
        id: &str,
        status: SyncStatus,
        updated_at: &str,
    ) -> Result<bool, sqlx::Error> {
        let mut tables = self.tables.write().await;
        match tables.assistants.get_mut(id) {
            Some(existing) => {
                existing.sync_status = status;
                existing.updated_at = updated_at.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_assistant(&self, id: &str) -> Result<bool, sqlx::Error> {
        self.check_assistant_write()?;
        Ok(self.tables.write().await.assistants.remove(id).is_some())
    }

    async fn find_customer(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Option<Customer>, sqlx::Error> {
        let tables = self.tables.read().await;
        let mut matches: Vec<&Customer> = tables
            .customers
            .iter()
            .filter(|customer| {
                (email.is_some() && customer.email.as_deref() == email)
                    || (phone.is_some() && customer.phone.as_deref() == phone)
            })
            .collect();
        matches.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matches.first().map(|customer| (*customer).clone()))
    }

    async fn insert_customer(&self, customer: &Customer) -> Result<(), sqlx::Error> {
        self.tables.write().await.customers.push(customer.clone());
        Ok(())
    }

    async fn update_customer_contact(
        &self,
        id: &str,
        name: &str,
        phone: Option<&str>,
        updated_at: &str,
    ) -> Result<(), sqlx::Error> {
        let mut tables = self.tables.write().await;
        if let Some(customer) = tables.customers.iter_mut().find(|c| c.id == id) {
            customer.name = name.to_string();
            customer.phone = phone.map(str::to_string);
            customer.updated_at = updated_at.to_string();
        }
        Ok(())
    }

    async fn get_customer(&self, id: &str) -> Result<Option<Customer>, sqlx::Error> {
        let tables = self.tables.read().await;
        Ok(tables.customers.iter().find(|c| c.id == id).cloned())
    }

    async fn get_thread(&self, id: &str) -> Result<Option<ConversationThread>, sqlx::Error> {
        let tables = self.tables.read().await;
        Ok(tables.threads.iter().find(|t| t.id == id).cloned())
    }

    async fn latest_thread(
        &self,
        customer_id: &str,
        assistant_id: &str,
    ) -> Result<Option<ConversationThread>, sqlx::Error> {
        let tables = self.tables.read().await;
        Ok(tables
            .threads
            .iter()
            .filter(|t| t.customer_id == customer_id && t.assistant_id == assistant_id)
            .max_by(|a, b| a.created_at.cmp(&b.created_at))
            .cloned())
    }

    async fn insert_thread(&self, thread: &ConversationThread) -> Result<(), sqlx::Error> {
        self.tables.write().await.threads.push(thread.clone());
        Ok(())
    }

    async fn list_threads(&self) -> Result<Vec<ThreadSummary>, sqlx::Error> {
        let tables = self.tables.read().await;
        let mut summaries: Vec<ThreadSummary> = tables
            .threads
            .iter()
            .filter_map(|thread| {
                let customer = tables
                    .customers
                    .iter()
                    .find(|c| c.id == thread.customer_id)?;
                Some(ThreadSummary {
                    id: thread.id.clone(),
                    provider_thread_id: thread.provider_thread_id.clone(),
                    assistant_id: thread.assistant_id.clone(),
                    created_at: thread.created_at.clone(),
                    customer: customer.clone(),
                })
            })
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    async fn insert_admin_session(&self, session: &AdminSession) -> Result<(), sqlx::Error> {
        self.tables
            .write()
            .await
            .admin_sessions
            .insert(session.token_hash.clone(), session.clone());
        Ok(())
    }

    async fn find_admin_session(
        &self,
        token_hash: &str,
        now: &str,
    ) -> Result<Option<AdminSession>, sqlx::Error> {
        let tables = self.tables.read().await;
        Ok(tables
            .admin_sessions
            .get(token_hash)
            .filter(|session| session.expires_at.as_str() > now)
            .cloned())
    }

    async fn delete_admin_session(&self, token_hash: &str) -> Result<(), sqlx::Error> {
        self.tables.write().await.admin_sessions.remove(token_hash);
        Ok(())
    }

    async fn purge_expired_admin_sessions(&self, now: &str) -> Result<u64, sqlx::Error> {
        let mut tables = self.tables.write().await;
        let before = tables.admin_sessions.len();
        tables
            .admin_sessions
            .retain(|_, session| session.expires_at.as_str() > now);
        Ok((before - tables.admin_sessions.len()) as u64)
    }
}
