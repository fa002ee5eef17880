//! Entity mapping: loads rows of one relation as [`Entity`] instances and
//! writes them back.
//!
//! An [`EntityMap`] knows the relation, the mapped fields with their SQL
//! types and the primary key. Every statement it builds returns the full
//! field list so entities are refreshed from what the server stored.

use std::collections::BTreeMap;

use tracing::debug;

use crate::connection::{quote_identifier, Connection};
use crate::entity::{Entity, EntityRef, Status};
use crate::error::{ContractViolation, Result};
use crate::filter::Param;
use crate::row::{ResultSet, Row};
use crate::statement::PLACEHOLDER;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    /// SQL type used to convert and cast the field (`int4`, `text[]`).
    pub sql_type: String,
}

#[derive(Debug, Clone)]
pub struct EntityMap {
    kind: String,
    relation: String,
    fields: Vec<FieldDef>,
    primary_key: Vec<String>,
}

impl EntityMap {
    /// `relation` is used verbatim in statements (`library.book`).
    pub fn new(kind: impl Into<String>, relation: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            relation: relation.into(),
            fields: Vec::new(),
            primary_key: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        let def = FieldDef {
            name: name.into(),
            sql_type: sql_type.into(),
        };
        match self.fields.iter_mut().find(|f| f.name == def.name) {
            Some(existing) => *existing = def,
            None => self.fields.push(def),
        }
        self
    }

    pub fn primary_key(mut self, fields: &[&str]) -> Self {
        self.primary_key = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn relation(&self) -> &str {
        &self.relation
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn primary_key_fields(&self) -> Vec<&str> {
        self.primary_key.iter().map(String::as_str).collect()
    }

    fn sql_type(&self, field: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == field)
            .map(|f| f.sql_type.as_str())
    }

    /// `$*::type` for mapped fields, a bare `$*` otherwise.
    fn placeholder(&self, field: &str) -> String {
        match self.sql_type(field) {
            Some(ty) => format!("{}::{}", PLACEHOLDER, ty),
            None => PLACEHOLDER.to_string(),
        }
    }

    fn param(&self, field: &str, value: Value) -> Param {
        match self.sql_type(field) {
            Some(ty) => Param::typed(value, ty),
            None => Param::new(value),
        }
    }

    fn projection(&self) -> String {
        if self.fields.is_empty() {
            return "*".to_string();
        }
        self.fields
            .iter()
            .map(|f| quote_identifier(&f.name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `"a" = $*::t AND "b" = $*::u` over the primary key, plus its params.
    fn primary_key_clause(&self, entity: &Entity) -> Result<(String, Vec<Param>)> {
        if self.primary_key.is_empty() {
            return Err(ContractViolation::EmptyPrimaryKey(self.kind.clone()).into());
        }
        let mut clauses = Vec::with_capacity(self.primary_key.len());
        let mut params = Vec::with_capacity(self.primary_key.len());
        for field in &self.primary_key {
            clauses.push(format!("{} = {}", quote_identifier(field), self.placeholder(field)));
            params.push(self.param(field, entity.get(field)?.clone()));
        }
        Ok((clauses.join(" AND "), params))
    }

    fn check_kind(&self, entity: &Entity) -> Result<()> {
        if entity.kind() != self.kind {
            return Err(ContractViolation::EntityKindMismatch {
                expected: self.kind.clone(),
                actual: entity.kind().to_string(),
            }
            .into());
        }
        Ok(())
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Build an entity from a converted row and pass it through the
    /// connection's identity mapper.
    pub fn create_object(&self, conn: &mut Connection, row: Row) -> Result<EntityRef> {
        let mut entity = Entity::with_fields(self.kind.as_str(), row.into_fields());
        entity.set_status(Status::EXIST);
        let pk = self.primary_key_fields();
        conn.identity_mapper_mut().get_instance(entity, &pk)
    }

    fn collect(&self, conn: &mut Connection, result: ResultSet) -> Result<Vec<EntityRef>> {
        result
            .into_iter()
            .map(|row| self.create_object(conn, row))
            .collect()
    }

    pub fn find_by_pk(
        &self,
        conn: &mut Connection,
        key: &[(&str, Value)],
    ) -> Result<Option<EntityRef>> {
        let probe = Entity::with_fields(self.kind.as_str(), key.iter().cloned());
        let (condition, params) = self.primary_key_clause(&probe)?;
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            self.projection(),
            self.relation,
            condition
        );
        let result = conn.query_with(&sql, params)?;
        Ok(self.collect(conn, result)?.into_iter().next())
    }

    /// Entities matching `condition`, a SQL predicate with `$*` markers
    /// bound to `values`.
    pub fn find_where(
        &self,
        conn: &mut Connection,
        condition: &str,
        values: &[Value],
    ) -> Result<Vec<EntityRef>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            self.projection(),
            self.relation,
            condition
        );
        let result = conn.query(&sql, values)?;
        self.collect(conn, result)
    }

    pub fn find_all(&self, conn: &mut Connection) -> Result<Vec<EntityRef>> {
        self.find_where(conn, "true", &[])
    }

    pub fn count_where(
        &self,
        conn: &mut Connection,
        condition: &str,
        values: &[Value],
    ) -> Result<i64> {
        let sql = format!(
            "SELECT count(*) AS count FROM {} WHERE {}",
            self.relation, condition
        );
        let result = conn.query(&sql, values)?;
        Ok(result
            .first()
            .and_then(|row| row.get_index(0))
            .and_then(Value::as_i64)
            .unwrap_or(0))
    }

    // ========================================================================
    // Writing
    // ========================================================================

    /// Insert a new entity or update an existing one, then refresh it from
    /// the stored row. Afterwards the entity exists and is unmodified.
    pub fn save_one(&self, conn: &mut Connection, entity: &EntityRef) -> Result<()> {
        let snapshot = entity.read().clone();
        self.check_kind(&snapshot)?;

        let (sql, params) = if snapshot.is_new() {
            self.insert_statement(&snapshot)
        } else {
            let names: Vec<&str> = self
                .fields
                .iter()
                .map(|f| f.name.as_str())
                .filter(|name| !self.primary_key.iter().any(|pk| pk == name))
                .filter(|name| snapshot.has(name))
                .collect();
            if names.is_empty() {
                return Ok(());
            }
            self.update_statement(&snapshot, &names)?
        };

        let result = conn.query_with(&sql, params)?;
        self.refresh(entity, result, Status::EXIST);
        if snapshot.is_new() && !entity.read().is_new() {
            let pk = self.primary_key_fields();
            conn.identity_mapper_mut().register(entity, &pk)?;
        }
        debug!(kind = %self.kind, relation = %self.relation, "entity saved");
        Ok(())
    }

    /// Update only `fields` and reload every field from the stored row. When
    /// no row matched, the entity loses its `EXIST` status.
    pub fn update_one(
        &self,
        conn: &mut Connection,
        entity: &EntityRef,
        fields: &[&str],
    ) -> Result<()> {
        let snapshot = entity.read().clone();
        self.check_kind(&snapshot)?;
        if fields.is_empty() {
            return Ok(());
        }

        let (sql, params) = self.update_statement(&snapshot, fields)?;
        let result = conn.query_with(&sql, params)?;
        self.refresh(entity, result, Status::EXIST);
        Ok(())
    }

    /// Delete the row of `entity`. The entity keeps the values returned by
    /// the server, loses its status and leaves the identity map.
    pub fn delete_one(&self, conn: &mut Connection, entity: &EntityRef) -> Result<()> {
        let snapshot = entity.read().clone();
        self.check_kind(&snapshot)?;

        let (condition, params) = self.primary_key_clause(&snapshot)?;
        let sql = format!(
            "DELETE FROM {} WHERE {} RETURNING {}",
            self.relation,
            condition,
            self.projection()
        );
        let result = conn.query_with(&sql, params)?;
        self.refresh(entity, result, Status::NONE);

        let pk = self.primary_key_fields();
        conn.identity_mapper_mut().clear(&snapshot, &pk)
    }

    fn insert_statement(&self, entity: &Entity) -> (String, Vec<Param>) {
        let present: Vec<&FieldDef> = self
            .fields
            .iter()
            .filter(|f| entity.get(&f.name).map_or(false, |v| !v.is_null()))
            .collect();

        if present.is_empty() {
            let sql = format!(
                "INSERT INTO {} DEFAULT VALUES RETURNING {}",
                self.relation,
                self.projection()
            );
            return (sql, Vec::new());
        }

        let columns: Vec<String> = present.iter().map(|f| quote_identifier(&f.name)).collect();
        let markers: Vec<String> = present.iter().map(|f| self.placeholder(&f.name)).collect();
        let params = present
            .iter()
            .filter_map(|f| entity.get(&f.name).ok().map(|v| self.param(&f.name, v.clone())))
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
            self.relation,
            columns.join(", "),
            markers.join(", "),
            self.projection()
        );
        (sql, params)
    }

    fn update_statement(&self, entity: &Entity, fields: &[&str]) -> Result<(String, Vec<Param>)> {
        let mut assignments = Vec::with_capacity(fields.len());
        let mut params = Vec::with_capacity(fields.len() + self.primary_key.len());
        for field in fields {
            assignments.push(format!("{} = {}", quote_identifier(field), self.placeholder(field)));
            params.push(self.param(field, entity.get(field)?.clone()));
        }
        let (condition, key_params) = self.primary_key_clause(entity)?;
        params.extend(key_params);

        let sql = format!(
            "UPDATE {} SET {} WHERE {} RETURNING {}",
            self.relation,
            assignments.join(", "),
            condition,
            self.projection()
        );
        Ok((sql, params))
    }

    /// Hydrate from the first returned row and set `status`. No row means
    /// the entity is gone.
    fn refresh(&self, entity: &EntityRef, result: ResultSet, status: Status) {
        let mut entity = entity.write();
        match result.into_iter().next() {
            Some(row) => {
                let fields: BTreeMap<String, Value> = row.into_fields();
                entity.hydrate(fields);
                entity.set_status(status);
            }
            None => entity.set_status(Status::NONE),
        }
    }
}
