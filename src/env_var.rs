use std::sync::OnceLock;

use serde::Deserialize;

fn default_backend() -> String {
    "local".to_owned()
}

fn default_threads() -> usize {
    match std::thread::available_parallelism() {
        Ok(n) => n.into(),
        Err(_) => 4,
    }
}

fn default_pool_size() -> usize {
    16 * 1024 * 1024
}

// Matches the 8 KiB staging buffer the GASPI-era deployments used.
fn default_coord_slot_size() -> usize {
    1 << 13
}

fn default_num_pes() -> usize {
    1
}

fn default_pe_id() -> usize {
    0
}

fn default_job_id() -> usize {
    0
}

fn default_pmem_dir() -> String {
    std::env::temp_dir()
        .join("lattice_pmem")
        .to_string_lossy()
        .into_owned()
}

#[derive(Deserialize, Debug)]
pub struct Config {
    /// The transport backend to use
    /// local -- single pe execution (default)
    /// shmem -- multi pe single node execution
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Number of worker threads in the sort thread pool
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Size in bytes of the process-local global memory pool
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Per-pe coordination slot size for shmem collectives, in bytes
    #[serde(default = "default_coord_slot_size")]
    pub coord_slot_size: usize,

    /// World size, set by the launcher for the shmem backend
    #[serde(default = "default_num_pes")]
    pub num_pes: usize,

    /// This process' rank, set by the launcher for the shmem backend
    #[serde(default = "default_pe_id")]
    pub pe_id: usize,

    /// Job id disambiguating shmem mappings of concurrent launches
    #[serde(default = "default_job_id")]
    pub job_id: usize,

    /// Directory holding persistent memory pool files
    #[serde(default = "default_pmem_dir")]
    pub pmem_dir: String,
}

/// Get the current environment variable configuration (`LATTICE_*`).
pub fn config() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(|| match envy::prefixed("LATTICE_").from_env::<Config>() {
        Ok(config) => config,
        Err(error) => panic!("{}", error),
    })
}
