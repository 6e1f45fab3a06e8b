//! Per-(type, source) runtime
//!
//! One fragment binds an entity type to one datasource: it renders and runs
//! the fetch query, projects the fetched rows into objects, and runs the
//! `commit_one` / `commit_all` hooks after events have been acknowledged by
//! the bus.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use courier_connector::projection::bindings;
use courier_connector::{
    run_query, AttrMapping, BoxedDatasource, FilterRegistry, Projection, QueryKind, Row, Template,
};
use courier_core::{Object, ObjectSet, Pkey, PkeyAttr, PkeyMergeConstraint, TypeSchema, Value};

use crate::config::{QueryConfig, SourceConfig, VarValue};
use crate::error::{ProducerError, ProducerResult};
use crate::predicate::Predicate;

/// Query text: raw or templated.
#[derive(Debug, Clone)]
enum QueryText {
    Raw(String),
    Template(Template),
}

/// A query variable compiled once; leaves may be templates.
#[derive(Debug, Clone)]
enum CompiledVar {
    Literal(Value),
    Template(Template),
    List(Vec<CompiledVar>),
    Map(BTreeMap<String, CompiledVar>),
}

/// A query binding compiled once per configuration load.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    kind: QueryKind,
    query: QueryText,
    vars: BTreeMap<String, CompiledVar>,
}

impl CompiledQuery {
    fn compile(
        context: &str,
        config: &QueryConfig,
        filters: &FilterRegistry,
    ) -> ProducerResult<CompiledQuery> {
        let query = if courier_connector::expr::is_template(&config.query) {
            QueryText::Template(Template::compile(context, &config.query, filters)?)
        } else {
            QueryText::Raw(config.query.clone())
        };
        let mut vars = BTreeMap::new();
        for (name, value) in &config.vars {
            vars.insert(name.clone(), compile_var(context, value, filters)?);
        }
        Ok(CompiledQuery {
            kind: config.kind,
            query,
            vars,
        })
    }

    /// Render the query text and its variables against a context row.
    fn render(&self, filters: &FilterRegistry, context: &Row) -> ProducerResult<(String, Row)> {
        let empty = Row::new();
        let lookup = bindings(context, &empty);

        let query = match &self.query {
            QueryText::Raw(text) => text.clone(),
            QueryText::Template(template) => template
                .render(filters, &lookup)?
                .map(|value| value.to_string())
                .unwrap_or_default(),
        };

        let mut vars = Row::new();
        for (name, var) in &self.vars {
            if let Some(value) = render_var(var, filters, &lookup)? {
                vars.insert(name.clone(), value);
            }
        }
        Ok((query, vars))
    }
}

fn compile_var(
    context: &str,
    value: &VarValue,
    filters: &FilterRegistry,
) -> ProducerResult<CompiledVar> {
    Ok(match value {
        VarValue::Bool(b) => CompiledVar::Literal(Value::Bool(*b)),
        VarValue::Int(i) => CompiledVar::Literal(Value::Integer(*i)),
        VarValue::Float(f) => CompiledVar::Literal(Value::Float(*f)),
        VarValue::Text(text) if courier_connector::expr::is_template(text) => {
            CompiledVar::Template(Template::compile(context, text, filters)?)
        }
        VarValue::Text(text) => CompiledVar::Literal(Value::String(text.clone())),
        VarValue::List(items) => CompiledVar::List(
            items
                .iter()
                .map(|item| compile_var(context, item, filters))
                .collect::<ProducerResult<Vec<_>>>()?,
        ),
        VarValue::Map(map) => {
            let mut out = BTreeMap::new();
            for (key, item) in map {
                out.insert(key.clone(), compile_var(context, item, filters)?);
            }
            CompiledVar::Map(out)
        }
    })
}

fn render_var(
    var: &CompiledVar,
    filters: &FilterRegistry,
    lookup: &dyn Fn(&[String]) -> Option<Value>,
) -> ProducerResult<Option<Value>> {
    Ok(match var {
        CompiledVar::Literal(value) => Some(value.clone()),
        CompiledVar::Template(template) => template.render(filters, lookup)?,
        CompiledVar::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                if let Some(value) = render_var(item, filters, lookup)? {
                    out.push(value);
                }
            }
            Some(Value::List(out))
        }
        CompiledVar::Map(map) => {
            let mut out = BTreeMap::new();
            for (key, item) in map {
                if let Some(value) = render_var(item, filters, lookup)? {
                    out.insert(key.clone(), value);
                }
            }
            Some(Value::Map(out))
        }
    })
}

/// Result of fetching one source.
#[derive(Debug, Default)]
pub struct FetchedRows {
    pub objects: Vec<Object>,
    /// Rows dropped with a projection diagnostic this cycle.
    pub dropped: u32,
}

impl std::fmt::Debug for SourceRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRuntime")
            .field("entity", &self.entity)
            .field("source_name", &self.source_name)
            .finish_non_exhaustive()
    }
}

/// Runtime binding of one entity type to one datasource.
pub struct SourceRuntime {
    pub entity: String,
    pub source_name: String,
    pub pkey_merge_constraint: PkeyMergeConstraint,
    pub merge_constraints: Vec<Predicate>,
    datasource: BoxedDatasource,
    filters: Arc<FilterRegistry>,
    projection: Projection,
    fetch: CompiledQuery,
    commit_one: Option<CompiledQuery>,
    commit_all: Option<CompiledQuery>,
    pkey: PkeyAttr,
    type_schema: TypeSchema,
}

impl SourceRuntime {
    pub fn new(
        entity: &str,
        type_schema: &TypeSchema,
        config: &SourceConfig,
        datasource: BoxedDatasource,
        filters: Arc<FilterRegistry>,
    ) -> ProducerResult<SourceRuntime> {
        if config.fetch.kind != QueryKind::Fetch {
            return Err(ProducerError::config_invalid(format!(
                "source '{}' of type '{entity}': fetch query must have type 'fetch'",
                config.name
            )));
        }
        for (hook, name) in [(&config.commit_one, "commit_one"), (&config.commit_all, "commit_all")]
        {
            if let Some(query) = hook {
                if query.kind == QueryKind::Fetch {
                    return Err(ProducerError::config_invalid(format!(
                        "source '{}' of type '{entity}': {name} cannot be a fetch",
                        config.name
                    )));
                }
            }
        }

        let context = format!("{entity}.{}", config.name);
        let projection = Projection::compile(&config.attrsmapping, &filters)?;
        let fetch = CompiledQuery::compile(&context, &config.fetch, &filters)?;
        let commit_one = config
            .commit_one
            .as_ref()
            .map(|q| CompiledQuery::compile(&context, q, &filters))
            .transpose()?;
        let commit_all = config
            .commit_all
            .as_ref()
            .map(|q| CompiledQuery::compile(&context, q, &filters))
            .transpose()?;

        Ok(SourceRuntime {
            entity: entity.to_string(),
            source_name: config.name.clone(),
            pkey_merge_constraint: config.pkey_merge_constraint,
            merge_constraints: config.merge_constraints.clone(),
            datasource,
            filters,
            projection,
            fetch,
            commit_one,
            commit_all,
            pkey: type_schema.pkey.clone(),
            type_schema: type_schema.clone(),
        })
    }

    /// Fetch this source and project its rows. Rows that fail projection
    /// are dropped for the cycle with a diagnostic; they do not abort the
    /// fetch.
    pub async fn fetch(&self, cache: &ObjectSet) -> ProducerResult<FetchedRows> {
        let (query, vars) = self.fetch.render(&self.filters, &Row::new())?;
        let rows = run_query(self.datasource.as_ref(), QueryKind::Fetch, &query, &vars)
            .await?
            .unwrap_or_default();
        debug!(
            entity = %self.entity,
            source = %self.source_name,
            rows = rows.len(),
            "source fetched"
        );

        let mut out = FetchedRows::default();
        for row in &rows {
            match self.project_row(row, cache) {
                Ok(obj) => out.objects.push(obj),
                Err(e) => {
                    warn!(
                        entity = %self.entity,
                        source = %self.source_name,
                        error = %e,
                        "row dropped by projection"
                    );
                    out.dropped += 1;
                }
            }
        }
        Ok(out)
    }

    fn project_row(&self, row: &Row, cache: &ObjectSet) -> ProducerResult<Object> {
        // The pkey is projected first so the cached object can be bound.
        let mut parts = Vec::new();
        for attr in self.pkey.attrs() {
            match self.projection.project_attr(&self.filters, attr, row)? {
                Some(value) => parts.push(value),
                None => {
                    return Err(ProducerError::Connector(
                        courier_connector::ConnectorError::projection_failed(
                            attr,
                            "primary key attribute has no value",
                        ),
                    ))
                }
            }
        }
        let pkey = match &self.pkey {
            PkeyAttr::Single(_) => Pkey::Single(parts.remove(0)),
            PkeyAttr::Composite(_) => Pkey::Composite(parts),
        };

        let cached = cache
            .get(&pkey)
            .map(|obj| obj.attrs().clone())
            .unwrap_or_default();
        let attrs = self.projection.project(&self.filters, row, &cached)?;
        Ok(Object::from_attrs(&self.entity, &self.type_schema, attrs)?)
    }

    /// Mark one object's changes as processed upstream, with the fetched
    /// and previously-cached values in scope.
    pub async fn commit_one(
        &self,
        fetched: &BTreeMap<String, Value>,
        cached: &BTreeMap<String, Value>,
    ) -> ProducerResult<()> {
        let Some(query) = &self.commit_one else {
            return Ok(());
        };
        let context: Row = [
            (
                "ITEM_FETCHED_VALUES".to_string(),
                Value::Map(fetched.clone()),
            ),
            ("ITEM_CACHED_VALUES".to_string(), Value::Map(cached.clone())),
        ]
        .into_iter()
        .collect();
        let (text, vars) = query.render(&self.filters, &context)?;
        run_query(self.datasource.as_ref(), query.kind, &text, &vars).await?;
        Ok(())
    }

    /// Mark the whole cycle as processed upstream.
    pub async fn commit_all(&self) -> ProducerResult<()> {
        let Some(query) = &self.commit_all else {
            return Ok(());
        };
        let (text, vars) = query.render(&self.filters, &Row::new())?;
        run_query(self.datasource.as_ref(), query.kind, &text, &vars).await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use courier_connector::{ConnectorResult, Datasource};
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    /// Datasource returning canned rows and recording mutation queries.
    pub(crate) struct StaticSource {
        pub rows: Vec<Row>,
        pub mutations: Mutex<Vec<(String, Row)>>,
    }

    impl StaticSource {
        pub fn new(rows: Vec<Row>) -> Arc<StaticSource> {
            Arc::new(StaticSource {
                rows,
                mutations: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Datasource for StaticSource {
        async fn fetch(&self, _query: &str, _vars: &Row) -> ConnectorResult<Vec<Row>> {
            Ok(self.rows.clone())
        }
        async fn add(&self, query: &str, vars: &Row) -> ConnectorResult<()> {
            self.record(query, vars);
            Ok(())
        }
        async fn modify(&self, query: &str, vars: &Row) -> ConnectorResult<()> {
            self.record(query, vars);
            Ok(())
        }
        async fn delete(&self, query: &str, vars: &Row) -> ConnectorResult<()> {
            self.record(query, vars);
            Ok(())
        }
        async fn test_connection(&self) -> ConnectorResult<()> {
            Ok(())
        }
    }

    impl StaticSource {
        fn record(&self, query: &str, vars: &Row) {
            if let Ok(mut mutations) = self.mutations.lock() {
                mutations.push((query.to_string(), vars.clone()));
            }
        }
    }

    pub(crate) fn users_schema() -> TypeSchema {
        TypeSchema {
            attributes: ["uid", "mail"].iter().map(ToString::to_string).collect(),
            secrets: BTreeSet::new(),
            cacheonly: BTreeSet::new(),
            local: BTreeSet::new(),
            pkey: PkeyAttr::Single("uid".to_string()),
            foreign_keys: BTreeMap::new(),
            to_string: None,
        }
    }

    fn source_config(yaml: &str) -> SourceConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn row(uid: i64, login: &str) -> Row {
        [
            ("id".to_string(), Value::from(uid)),
            ("login".to_string(), Value::from(login)),
        ]
        .into_iter()
        .collect()
    }

    fn runtime(rows: Vec<Row>) -> (Arc<StaticSource>, SourceRuntime) {
        let config = source_config(
            r#"
name: hr
fetch:
  type: fetch
  query: SELECT id, login FROM users
commit_one:
  type: modify
  query: UPDATE users SET processed = true WHERE id = :id
  vars:
    id: "${ITEM_FETCHED_VALUES.uid}"
attrsmapping:
  uid: id
  mail: "${login | lower}@corp.example"
"#,
        );
        let source = StaticSource::new(rows);
        let runtime = SourceRuntime::new(
            "Users",
            &users_schema(),
            &config,
            source.clone(),
            Arc::new(FilterRegistry::builtin()),
        )
        .unwrap();
        (source, runtime)
    }

    #[tokio::test]
    async fn test_fetch_projects_rows() {
        let (_source, runtime) = runtime(vec![row(1, "Alice"), row(2, "Bob")]);
        let fetched = runtime.fetch(&ObjectSet::new()).await.unwrap();
        assert_eq!(fetched.objects.len(), 2);
        assert_eq!(fetched.dropped, 0);
        assert_eq!(fetched.objects[0].pkey, Pkey::from(1));
        assert_eq!(
            fetched.objects[0].get("mail"),
            Some(&Value::from("alice@corp.example"))
        );
    }

    #[tokio::test]
    async fn test_row_without_pkey_is_dropped() {
        let mut bad = Row::new();
        bad.insert("login".to_string(), Value::from("ghost"));
        let (_source, runtime) = runtime(vec![row(1, "Alice"), bad]);
        let fetched = runtime.fetch(&ObjectSet::new()).await.unwrap();
        assert_eq!(fetched.objects.len(), 1);
        assert_eq!(fetched.dropped, 1);
    }

    #[tokio::test]
    async fn test_commit_one_binds_fetched_values() {
        let (source, runtime) = runtime(vec![row(1, "Alice")]);
        let fetched = runtime.fetch(&ObjectSet::new()).await.unwrap();
        let obj = &fetched.objects[0];

        runtime
            .commit_one(obj.attrs(), &BTreeMap::new())
            .await
            .unwrap();

        let mutations = source.mutations.lock().unwrap();
        assert_eq!(mutations.len(), 1);
        assert_eq!(mutations[0].1.get("id"), Some(&Value::from(1)));
    }

    #[tokio::test]
    async fn test_commit_all_absent_is_noop() {
        let (source, runtime) = runtime(vec![]);
        runtime.commit_all().await.unwrap();
        assert!(source.mutations.lock().unwrap().is_empty());
    }

    #[test]
    fn test_fetch_kind_enforced() {
        let config = source_config(
            r#"
name: hr
fetch:
  type: modify
  query: UPDATE users SET x = 1
attrsmapping:
  uid: id
"#,
        );
        let err = SourceRuntime::new(
            "Users",
            &users_schema(),
            &config,
            StaticSource::new(vec![]),
            Arc::new(FilterRegistry::builtin()),
        )
        .unwrap_err();
        assert!(err.to_string().contains("must have type 'fetch'"));
    }
}
