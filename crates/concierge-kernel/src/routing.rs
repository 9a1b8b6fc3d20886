use std::collections::BTreeMap;

/// Modules a tenant can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModuleKind {
    CustomerService,
    Sales,
    Booking,
    Marketing,
}

impl ModuleKind {
    pub const ALL: [ModuleKind; 4] = [
        ModuleKind::CustomerService,
        ModuleKind::Sales,
        ModuleKind::Booking,
        ModuleKind::Marketing,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "customer_service" | "cs" => Some(ModuleKind::CustomerService),
            "sales" => Some(ModuleKind::Sales),
            "booking" => Some(ModuleKind::Booking),
            "marketing" => Some(ModuleKind::Marketing),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModuleKind::CustomerService => "customer_service",
            ModuleKind::Sales => "sales",
            ModuleKind::Booking => "booking",
            ModuleKind::Marketing => "marketing",
        }
    }
}

/// Handler implementations that actually exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Knowledge-grounded question answering.
    Generic,
}

impl HandlerKind {
    pub fn name(&self) -> &'static str {
        match self {
            HandlerKind::Generic => "generic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteReason {
    /// The module has its own registered handler.
    Registered,
    /// The module is known but has no dedicated handler yet.
    Unimplemented,
    /// The module name is not recognised.
    UnknownModule,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub module: Option<ModuleKind>,
    pub handler: HandlerKind,
    pub reason: RouteReason,
}

impl Route {
    pub fn is_fallback(&self) -> bool {
        self.reason != RouteReason::Registered
    }
}

/// Module name → handler. Every module without a dedicated handler is listed
/// explicitly as delegating to `default_handler`.
#[derive(Debug, Clone)]
pub struct DispatchTable {
    entries: BTreeMap<ModuleKind, (HandlerKind, RouteReason)>,
    default_handler: HandlerKind,
}

impl Default for DispatchTable {
    fn default() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            ModuleKind::CustomerService,
            (HandlerKind::Generic, RouteReason::Registered),
        );
        // Sales, booking and marketing flows reuse the generic handler until they get
        // their own.
        for module in [ModuleKind::Sales, ModuleKind::Booking, ModuleKind::Marketing] {
            entries.insert(module, (HandlerKind::Generic, RouteReason::Unimplemented));
        }
        Self {
            entries,
            default_handler: HandlerKind::Generic,
        }
    }
}

impl DispatchTable {
    pub fn register(&mut self, module: ModuleKind, handler: HandlerKind) {
        self.entries
            .insert(module, (handler, RouteReason::Registered));
    }

    pub fn route(&self, module_name: &str) -> Route {
        let Some(module) = ModuleKind::from_name(module_name) else {
            return Route {
                module: None,
                handler: self.default_handler,
                reason: RouteReason::UnknownModule,
            };
        };
        match self.entries.get(&module) {
            Some((handler, reason)) => Route {
                module: Some(module),
                handler: *handler,
                reason: *reason,
            },
            None => Route {
                module: Some(module),
                handler: self.default_handler,
                reason: RouteReason::Unimplemented,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn customer_service_is_registered() {
        let route = DispatchTable::default().route("customer_service");
        assert_eq!(route.module, Some(ModuleKind::CustomerService));
        assert_eq!(route.handler, HandlerKind::Generic);
        assert!(!route.is_fallback());
    }

    #[test]
    fn unimplemented_modules_fall_back_explicitly() {
        let table = DispatchTable::default();
        for name in ["sales", "booking", "marketing"] {
            let route = table.route(name);
            assert_eq!(route.handler, HandlerKind::Generic);
            assert_eq!(route.reason, RouteReason::Unimplemented);
        }
    }

    #[test]
    fn unknown_module_uses_default_handler() {
        let route = DispatchTable::default().route("astrology");
        assert_eq!(route.module, None);
        assert_eq!(route.reason, RouteReason::UnknownModule);
        assert_eq!(route.handler, HandlerKind::Generic);
    }

    #[test]
    fn module_names_are_case_insensitive() {
        assert_eq!(ModuleKind::from_name(" Sales "), Some(ModuleKind::Sales));
        assert_eq!(ModuleKind::from_name("CS"), Some(ModuleKind::CustomerService));
    }

    #[test]
    fn registering_promotes_a_module() {
        let mut table = DispatchTable::default();
        table.register(ModuleKind::Sales, HandlerKind::Generic);
        assert!(!table.route("sales").is_fallback());
    }

    #[test]
    fn every_module_has_an_entry() {
        let table = DispatchTable::default();
        for module in ModuleKind::ALL {
            assert_eq!(table.route(module.name()).module, Some(module));
        }
    }
}
