pub mod config;
#[cfg(feature = "sqlite")]
pub mod database;
pub mod executors;
pub mod ingest;
pub mod numeric;
pub mod optimization;
pub mod params;
pub mod quality;
pub mod repository;
pub mod run;
pub mod threading;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod config_test;
#[cfg(test)]
mod params_test;
