// Copyright (C) 2024 RecordManager-rs contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.

//! Command line entry point: wires a [`Coordinator`] from a TOML config and
//! a datasources table, and dispatches one of its operations by exit code.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{arg, ArgMatches, Command};
use indexcore::cluster_monitor::{ClusterMonitor, HttpClusterStateProbe};
use indexcore::config::{DataSourceTable, SolrIndexingConfig};
use indexcore::coordinator::{Coordinator, SolrSearchService, SourceFilter, UpdateOptions};
use indexcore::document_builder::DocumentBuilder;
use indexcore::enrichment::{EnrichmentBridge, EnricherRegistry, FieldMapper, MappingTables};
use indexcore::error::{CoreErrorKind, CoreResult};
use indexcore::merge_engine::MergeEngine;
use indexcore::metadata::MetadataRecordRegistry;
use indexcore::model::{FieldValue, SolrDocument};
use indexcore::solr_client::{ReqwestSolrTransport, SolrClient};
use indexcore::store::DocumentStore;
use indexcore::update_buffer::BatchSink;
use indexcore::worker_pool::Cancellation;
use indexcore::xslt::UnconfiguredXsltEngine;
use time::OffsetDateTime;

fn cli() -> Command<'static> {
    Command::new("recman-index")
        .about("Projects bibliographic source records into a Solr index.")
        .arg(arg!(--config <CONFIG> "Path to the Solr indexing TOML config").env("RECMAN_CONFIG"))
        .arg(arg!(--datasources <DATASOURCES> "Path to the datasources TOML table").env("RECMAN_DATASOURCES"))
        .arg(arg!(--from [TIMESTAMP] "Override the checkpoint; RFC3339, e.g. 2024-01-01T00:00:00Z"))
        .arg(arg!(--source [FILTER] "Comma-separated source filter, e.g. `a,b,-c,-/^test/`"))
        .arg(arg!(--single [ID] "Process only this one record id"))
        .arg(arg!(--"no-commit" "Skip the final Solr commit"))
        .arg(arg!(--delete "Delete the matched source's documents instead of indexing"))
        .arg(arg!(--compare "Diff built documents against the live index instead of indexing"))
        .arg(arg!(--"dump-prefix" [PREFIX] "Write batches to numbered dump files instead of Solr"))
        .arg(arg!(--"date-per-server" "Track the checkpoint separately per update url"))
        .arg(arg!(-v --verbose "Enable debug-level logging"))
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();
    init_tracing(matches.is_present("verbose"));

    match run(&matches).await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(err) => {
            tracing::error!(error = %err, "recman-index-failed");
            std::process::exit(2);
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose { "indexcore=debug,recman_index=debug" } else { "indexcore=info,recman_index=info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();
}

async fn run(matches: &ArgMatches) -> Result<i32> {
    let config_path = matches.value_of("config").context("--config is required")?;
    let datasources_path = matches.value_of("datasources").context("--datasources is required")?;

    let config = Arc::new(load_config(config_path)?);
    let datasources = Arc::new(load_datasources(datasources_path)?);

    let cluster_monitor = Arc::new(build_cluster_monitor(&config));
    let transport = Arc::new(ReqwestSolrTransport::new(config.username.clone(), config.password.clone()));
    let solr = Arc::new(SolrClient::new(
        config.update_url.clone(),
        transport,
        cluster_monitor,
        config.max_update_tries,
        Duration::from_secs(config.update_retry_wait_secs),
    ));

    let mapper = FieldMapper::new(MappingTables::default());
    let enrichment = EnrichmentBridge::new(EnricherRegistry::new(), Vec::new());
    let builder = Arc::new(DocumentBuilder::new(config.clone(), mapper, enrichment, Arc::new(UnconfiguredXsltEngine)));
    let merge_engine = Arc::new(MergeEngine::new(config.clone()));
    let metadata_registry = Arc::new(MetadataRecordRegistry::new());

    let search: Arc<dyn SolrSearchService> = Arc::new(HttpSolrSearchService::new(config.search_url.clone()));
    let store = connect_store().await?;
    let cancellation = Cancellation::new();
    wire_sigint(cancellation.clone());

    let coordinator = Coordinator::new(
        store,
        config.clone(),
        datasources,
        metadata_registry,
        builder,
        merge_engine,
        solr,
        search,
        cancellation,
    );

    let options = build_update_options(matches)?;
    let sink = NoopSink;
    let exit_code = coordinator.update_records(&options, &sink).await?;
    Ok(exit_code)
}

fn load_config(path: &str) -> Result<SolrIndexingConfig> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading config at {path}"))?;
    SolrIndexingConfig::parse(&raw).with_context(|| format!("parsing config at {path}"))
}

fn load_datasources(path: &str) -> Result<DataSourceTable> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading datasources at {path}"))?;
    indexcore::config::parse_datasources(&raw).with_context(|| format!("parsing datasources at {path}"))
}

fn build_cluster_monitor(config: &SolrIndexingConfig) -> ClusterMonitor {
    let probe = config.admin_url.clone().map(|admin_url| {
        let probe: Box<dyn indexcore::cluster_monitor::ClusterStateProbe> =
            Box::new(HttpClusterStateProbe::new(admin_url, reqwest::Client::new()));
        probe
    });
    ClusterMonitor::new(probe, config.cluster_state_check_interval_secs)
}

fn build_update_options(matches: &ArgMatches) -> Result<UpdateOptions> {
    let from = matches
        .value_of("from")
        .map(|raw| OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339))
        .transpose()
        .context("--from must be RFC3339")?;
    let source_filter = matches
        .value_of("source")
        .map(SourceFilter::parse)
        .unwrap_or_default();
    Ok(UpdateOptions {
        from,
        source_filter,
        single_id: matches.value_of("single").map(str::to_string),
        no_commit: matches.is_present("no-commit"),
        delete: matches.is_present("delete"),
        compare: matches.is_present("compare"),
        dump_prefix: matches.value_of("dump-prefix").map(PathBuf::from),
        date_per_server: matches.is_present("date-per-server"),
    })
}

/// Connecting to the document store is an external collaborator concern;
/// this binary has no concrete store implementation to reach for, so it
/// fails fast with a clear contract error rather than pretending to offer
/// one.
async fn connect_store() -> Result<Arc<dyn DocumentStore>> {
    bail!("no DocumentStore implementation is wired into this binary; link one in before running")
}

fn wire_sigint(cancellation: Cancellation) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancellation.cancel();
        }
    });
}

struct NoopSink;

#[async_trait::async_trait]
impl BatchSink for NoopSink {
    async fn submit_upserts(&self, _docs: Vec<SolrDocument>) -> CoreResult<()> {
        Ok(())
    }

    async fn submit_deletes(&self, _ids: Vec<String>) -> CoreResult<()> {
        Ok(())
    }
}

/// Fetches a single document by id from Solr's `/select` handler, used by
/// compare mode and `check-indexed-records`.
struct HttpSolrSearchService {
    search_url: String,
    client: reqwest::Client,
}

impl HttpSolrSearchService {
    fn new(search_url: String) -> Self {
        HttpSolrSearchService {
            search_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl SolrSearchService for HttpSolrSearchService {
    async fn fetch_by_id(&self, id: &str) -> CoreResult<Option<SolrDocument>> {
        let response = self
            .client
            .get(&self.search_url)
            .query(&[("q", format!("id:\"{id}\"")), ("wt", "json".to_string()), ("rows", "1".to_string())])
            .send()
            .await
            .map_err(|e| CoreErrorKind::TransientIo.with_error(e))?;
        if !response.status().is_success() {
            return Err(CoreErrorKind::TransientIo.with_error(anyhow::anyhow!(
                "solr search returned HTTP {}",
                response.status()
            )));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CoreErrorKind::Contract.with_error(e))?;
        let Some(doc) = body
            .get("response")
            .and_then(|r| r.get("docs"))
            .and_then(|docs| docs.as_array())
            .and_then(|docs| docs.first())
        else {
            return Ok(None);
        };
        Ok(Some(json_to_solr_doc(doc)))
    }
}

fn json_to_solr_doc(value: &serde_json::Value) -> SolrDocument {
    let mut doc = SolrDocument::new();
    let Some(obj) = value.as_object() else { return doc };
    for (field, v) in obj {
        let field_value = match v {
            serde_json::Value::Array(values) => FieldValue::Multi(
                values
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect(),
            ),
            serde_json::Value::String(s) => FieldValue::Single(s.clone()),
            other => FieldValue::Single(other.to_string()),
        };
        doc.insert(field.clone(), field_value);
    }
    doc
}

