//! Class name to handler resolution.
//!
//! Two independent tables: instance handlers and method handlers. Several
//! class names may share one handler instance. The registry is built once at
//! provider construction and only read afterwards.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::handler::{InstanceHandler, MethodHandler};
use crate::handlers::{
    computer_system::{VmHandler, VmMethods},
    host::HostHandler,
    job::{JobHandler, JobMethods, JOB_CLASSES},
    migration::MigrationMethods,
    services::{ServicesHandler, SERVICE_CLASSES},
};

#[derive(Default)]
pub struct Registry {
    instance: HashMap<String, Arc<dyn InstanceHandler>>,
    method: HashMap<String, Arc<dyn MethodHandler>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in handlers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        let jobs: Arc<dyn InstanceHandler> = Arc::new(JobHandler);
        registry.register_instance(JOB_CLASSES, jobs);
        registry.register_method(JOB_CLASSES, Arc::new(JobMethods));

        registry.register_instance(&["Xen_ComputerSystem"], Arc::new(VmHandler));
        registry.register_method(&["Xen_ComputerSystem"], Arc::new(VmMethods));

        registry.register_instance(&["Xen_HostComputerSystem"], Arc::new(HostHandler));

        registry.register_instance(SERVICE_CLASSES, Arc::new(ServicesHandler));
        registry.register_method(
            &["Xen_VirtualSystemMigrationService"],
            Arc::new(MigrationMethods),
        );

        registry
    }

    /// Register an instance handler for each class name.
    ///
    /// A class that is already registered keeps its first handler.
    pub fn register_instance(&mut self, class_names: &[&str], handler: Arc<dyn InstanceHandler>) {
        for name in class_names {
            if self.instance.contains_key(*name) {
                warn!(class_name = %name, "Duplicate instance handler registration ignored");
                continue;
            }
            debug!(class_name = %name, "Registered instance handler");
            self.instance.insert(name.to_string(), Arc::clone(&handler));
        }
    }

    /// Register a method handler for each class name.
    ///
    /// A class that is already registered keeps its first handler.
    pub fn register_method(&mut self, class_names: &[&str], handler: Arc<dyn MethodHandler>) {
        for name in class_names {
            if self.method.contains_key(*name) {
                warn!(class_name = %name, "Duplicate method handler registration ignored");
                continue;
            }
            debug!(class_name = %name, "Registered method handler");
            self.method.insert(name.to_string(), Arc::clone(&handler));
        }
    }

    pub fn resolve_instance_handler(&self, class_name: &str) -> Option<Arc<dyn InstanceHandler>> {
        self.instance.get(class_name).cloned()
    }

    pub fn resolve_method_handler(&self, class_name: &str) -> Option<Arc<dyn MethodHandler>> {
        self.method.get(class_name).cloned()
    }

    /// Registered instance classes, sorted.
    pub fn instance_classes(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.instance.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Registered method classes, sorted.
    pub fn method_classes(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.method.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
