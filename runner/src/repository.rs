pub mod finder;


#[cfg(feature = "sqlite")]
use crate::database::{sqlite::StatusEntry, SharedConnection};
use crate::{
    config::{BackendConfig, ConfigErrors},
    ingest::{IngestorMap, Ingestors},
    numeric::{NumericBackend, RscriptBackend},
    quality::QualityMeasure,
    run::{parser::RunTemplate, RunStatus},
};
use chrono::Local;
use parking_lot::RwLock;
use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, error, info};

/// Configuration and run templates shared by every thread.
#[derive(Debug)]
pub struct Repository {
    config: BackendConfig,
    templates: RwLock<BTreeMap<String, Arc<RunTemplate>>>,
    ingestors: IngestorMap,
    numeric: Option<Arc<dyn NumericBackend>>,
    #[cfg(feature = "sqlite")]
    database: Option<SharedConnection>,
    initialized: AtomicBool,
}

impl Repository {
    pub fn load(config: BackendConfig) -> Result<Self, ConfigErrors> {
        let ingestors = Ingestors::load_all(&config.ingest)?;
        let numeric = config
            .numeric
            .as_ref()
            .map(|numeric| Arc::new(RscriptBackend::load(numeric)) as Arc<dyn NumericBackend>);

        #[cfg(feature = "sqlite")]
        let database = match config.database {
            Some(ref database) => {
                let connection = SharedConnection::load(database)?;
                connection.init()?;
                Some(connection)
            }
            None => None,
        };

        info!(repository = ?config.repository, "Loaded repository");

        Ok(Self {
            config,
            templates: RwLock::new(BTreeMap::new()),
            ingestors,
            numeric,
            #[cfg(feature = "sqlite")]
            database,
            initialized: AtomicBool::new(false),
        })
    }

    pub fn with_numeric(mut self, numeric: Arc<dyn NumericBackend>) -> Self {
        self.numeric = Some(numeric);
        self
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn result_folder(&self, result_id: &str) -> PathBuf {
        self.config.results_dir().join(result_id)
    }

    pub fn ingestor(&self, name: &str) -> Option<&Ingestors> {
        self.ingestors.get(name)
    }

    pub fn numeric(&self) -> Option<Arc<dyn NumericBackend>> {
        self.numeric.clone()
    }

    /// Quality measures for `names`, unknown names are skipped.
    pub fn measures(&self, names: &[String]) -> Vec<QualityMeasure> {
        names
            .iter()
            .filter_map(|name| {
                self.config
                    .quality_measures
                    .get(name)
                    .map(|config| QualityMeasure::from_config(name, config))
            })
            .collect()
    }

    /// Register or replace a template, returns true if it changed.
    pub fn register_template(&self, template: RunTemplate) -> bool {
        let mut templates = self.templates.write();

        if let Some(known) = templates.get(&template.name) {
            if known.source == template.source && known.modified == template.modified {
                return false;
            }
        }

        debug!(run = template.name, "Registered run");
        templates.insert(template.name.clone(), Arc::new(template));

        true
    }

    pub fn remove_template(&self, name: &str) -> bool {
        self.templates.write().remove(name).is_some()
    }

    pub fn run_template(&self, name: &str) -> Option<Arc<RunTemplate>> {
        self.templates.read().get(name).cloned()
    }

    pub fn template_names(&self) -> Vec<String> {
        self.templates.read().keys().cloned().collect()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn set_initialized(&self) {
        if !self.initialized.swap(true, Ordering::SeqCst) {
            info!(runs = self.templates.read().len(), "Repository initialized");
        }
    }

    /// Persist a status transition, failures are logged only.
    #[cfg(feature = "sqlite")]
    pub fn record_status(&self, run: &str, client: &str, resume: bool, status: RunStatus) {
        let Some(ref database) = self.database else {
            return;
        };

        let entry = StatusEntry {
            run: run.to_owned(),
            client: client.to_owned(),
            resume,
            status,
            changed: Local::now().format("%m_%d_%Y-%H_%M_%S").to_string(),
        };

        if let Err(error) = database.store_status(&entry) {
            error!(error = ?error, run = run, "Failed to store run status: {error}");
        }
    }

    #[cfg(not(feature = "sqlite"))]
    pub fn record_status(&self, run: &str, _client: &str, _resume: bool, status: RunStatus) {
        debug!(run = run, status = ?status, time = %Local::now(), "Run status changed");
    }

    #[cfg(feature = "sqlite")]
    pub fn database(&self) -> Option<&SharedConnection> {
        self.database.as_ref()
    }
}
