//! Read only view of the vehicle's OBD modules

/// An ECU claiming OBD compliance
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ObdModule {
    /// Source address of the module
    pub source_address: u8,
    /// SPNs the module claims to support (From its DM24 response)
    pub supported_spns: Vec<u32>,
}

impl ObdModule {
    /// Creates a new module entry
    pub fn new(source_address: u8, supported_spns: &[u32]) -> Self {
        Self {
            source_address,
            supported_spns: supported_spns.to_vec(),
        }
    }

    /// True if the module claims support for `spn`
    pub fn supports(&self, spn: u32) -> bool {
        self.supported_spns.contains(&spn)
    }
}

/// Supplies the in-scope modules. Never modified by the query layer
pub trait ModuleRegistry {
    /// Every in-scope OBD module, in ascending address order
    fn obd_modules(&self) -> Vec<&ObdModule>;

    /// Looks up a module by address
    fn module(&self, address: u8) -> Option<&ObdModule> {
        self.obd_modules()
            .into_iter()
            .find(|m| m.source_address == address)
    }

    /// Addresses of every in-scope OBD module
    fn addresses(&self) -> Vec<u8> {
        self.obd_modules().iter().map(|m| m.source_address).collect()
    }
}

/// [ModuleRegistry] over a fixed list of modules
#[derive(Debug, Clone, Default)]
pub struct VehicleModules {
    modules: Vec<ObdModule>,
}

impl VehicleModules {
    /// Creates a registry. Later entries for the same address are dropped
    pub fn new<I: IntoIterator<Item = ObdModule>>(modules: I) -> Self {
        let mut list: Vec<ObdModule> = Vec::new();
        for m in modules {
            if list.iter().any(|x| x.source_address == m.source_address) {
                log::warn!("Module 0x{:02X} registered twice, ignoring", m.source_address);
                continue;
            }
            list.push(m);
        }
        list.sort_by_key(|m| m.source_address);
        Self { modules: list }
    }
}

impl ModuleRegistry for VehicleModules {
    fn obd_modules(&self) -> Vec<&ObdModule> {
        self.modules.iter().collect()
    }
}
