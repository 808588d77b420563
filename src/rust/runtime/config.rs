// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    memory::TaskAllocator,
};
use ::std::{
    fs::File,
    io::Read,
    ops::Index,
    str::FromStr,
    thread,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Constants
//======================================================================================================================

// Task system options. Environment variables named after each key, upper-cased, override the file.
mod taskkit_config {
    pub const SECTION_NAME: &str = "taskkit";
    // Number of schedulers created for the thread that initializes the task system.
    pub const MAIN_THREAD_SCHEDULERS: &str = "main_thread_schedulers";
    // Number of thread pool workers.
    pub const THREAD_POOL_SIZE: &str = "thread_pool_size";
    // Capacity reserved up front in every scheduler queue.
    pub const RESERVED_TASK_COUNT: &str = "reserved_task_count";
    // Frame allocator: "pool" or "global".
    pub const ALLOCATOR: &str = "allocator";
}

const DEFAULT_MAIN_THREAD_SCHEDULERS: usize = 1;
const DEFAULT_RESERVED_TASK_COUNT: usize = 100;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Task system configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Schedulers created for the initializing thread.
    pub main_thread_schedulers: usize,
    /// Thread pool workers. Zero disables the pool.
    pub thread_pool_size: usize,
    /// Queue capacity reserved in every scheduler.
    pub reserved_task_count: usize,
    /// Allocator of task frames.
    pub allocator: TaskAllocator,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Config {
    /// Reads the configuration file at `config_path`. Missing keys keep their default value.
    pub fn new(config_path: &str) -> Result<Self, Fail> {
        let mut config_s: String = String::new();
        File::open(config_path)?.read_to_string(&mut config_s)?;
        Self::from_yaml_str(&config_s)
    }

    /// Parses a YAML document holding a `taskkit` section.
    pub fn from_yaml_str(config_s: &str) -> Result<Self, Fail> {
        let config: Vec<Yaml> = match YamlLoader::load_from_str(config_s) {
            Ok(config) => config,
            Err(e) => {
                let cause: String = format!("failed to parse configuration: {}", e);
                error!("from_yaml_str(): {:?}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let config_obj: &Yaml = match &config[..] {
            [c] => c,
            _ => return Err(Fail::new(libc::EINVAL, "Wrong number of config objects")),
        };
        let section: &Yaml = Self::get_subsection(config_obj, taskkit_config::SECTION_NAME)?;

        let mut config: Self = Self::default();
        if let Some(value) = Self::get_usize(section, taskkit_config::MAIN_THREAD_SCHEDULERS)? {
            config.main_thread_schedulers = value;
        }
        if let Some(value) = Self::get_usize(section, taskkit_config::THREAD_POOL_SIZE)? {
            config.thread_pool_size = value;
        }
        if let Some(value) = Self::get_usize(section, taskkit_config::RESERVED_TASK_COUNT)? {
            config.reserved_task_count = value;
        }
        let allocator: Option<String> = match Self::get_typed_env_option(taskkit_config::ALLOCATOR)? {
            Some(value) => Some(value),
            None => section.index(taskkit_config::ALLOCATOR).as_str().map(str::to_string),
        };
        if let Some(name) = allocator {
            config.allocator = Self::parse_allocator(&name)?;
        }

        if config.main_thread_schedulers == 0 {
            let cause: String = format!("parameter \"{}\" must be at least 1", taskkit_config::MAIN_THREAD_SCHEDULERS);
            error!("from_yaml_str(): {:?}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        Ok(config)
    }

    /// Replaces the frame allocator.
    pub fn with_allocator(mut self, allocator: TaskAllocator) -> Self {
        self.allocator = allocator;
        self
    }

    /// Number of thread pool workers used when none is configured: one per available core, minus the main thread.
    pub fn default_thread_pool_size() -> usize {
        match thread::available_parallelism() {
            Ok(cores) => cores.get().saturating_sub(1).max(1),
            Err(_) => 1,
        }
    }

    fn parse_allocator(name: &str) -> Result<TaskAllocator, Fail> {
        match name {
            "pool" => Ok(TaskAllocator::pool()),
            "global" => Ok(TaskAllocator::global()),
            _ => {
                let cause: String = format!("unknown allocator (name={:?})", name);
                error!("parse_allocator(): {:?}", cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }

    /// Reads an optional unsigned integer, the environment taking precedence over the file.
    fn get_usize(yaml: &Yaml, index: &str) -> Result<Option<usize>, Fail> {
        if let Some(value) = Self::get_typed_env_option(index)? {
            return Ok(Some(value));
        }
        match yaml.index(index) {
            Yaml::BadValue => Ok(None),
            _ => Self::get_int_option(yaml, index).map(Some),
        }
    }

    /// Index `yaml` to find the value at `index`, validating that it is a hash.
    fn get_subsection<'a>(yaml: &'a Yaml, index: &str) -> Result<&'a Yaml, Fail> {
        let section: &'a Yaml = Self::get_option(yaml, index)?;
        match section {
            Yaml::Hash(_) => Ok(section),
            _ => {
                let message: String = format!("parameter \"{}\" has unexpected type", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    /// Index `yaml` to find the value at `index`, validating that the index exists.
    fn get_option<'a>(yaml: &'a Yaml, index: &str) -> Result<&'a Yaml, Fail> {
        match yaml.index(index) {
            Yaml::BadValue => {
                let message: String = format!("missing configuration option \"{}\"", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
            value => Ok(value),
        }
    }

    /// Get value where the environment value overrides the config file if it exists.
    fn get_typed_env_option<T: FromStr>(index: &str) -> Result<Option<T>, Fail> {
        if let Ok(var) = ::std::env::var(index.to_uppercase()) {
            if let Ok(value) = var.as_str().parse() {
                return Ok(Some(value));
            } else {
                let message: String = format!("parameter {} has unexpected type", index);
                return Err(Fail::new(libc::EINVAL, message.as_str()));
            }
        }
        Ok(None)
    }

    /// Reads an integer and verifies that the destination type may hold it.
    fn get_int_option<T: TryFrom<i64>>(yaml: &Yaml, index: &str) -> Result<T, Fail> {
        let val: i64 = match Self::get_option(yaml, index)?.as_i64() {
            Some(val) => val,
            None => {
                let message: String = format!("parameter {} has unexpected type", index);
                return Err(Fail::new(libc::EINVAL, message.as_str()));
            },
        };
        match T::try_from(val) {
            Ok(val) => Ok(val),
            _ => {
                let message: String = format!("parameter \"{}\" is out of range", index);
                Err(Fail::new(libc::ERANGE, message.as_str()))
            },
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for Config {
    fn default() -> Self {
        Self {
            main_thread_schedulers: DEFAULT_MAIN_THREAD_SCHEDULERS,
            thread_pool_size: Self::default_thread_pool_size(),
            reserved_task_count: DEFAULT_RESERVED_TASK_COUNT,
            allocator: TaskAllocator::pool(),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
