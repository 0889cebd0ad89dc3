//! Module and package loading inside an execution context.
//!
//! Packages are keyed by `name@version`, so two versions of one package can
//! be loaded side by side. A cell only ever sees a package through the alias
//! its directive bound.

use std::path::Path;
use std::sync::Arc;

use libloading::Library;
use rustc_hash::FxHashMap;

use super::types::{ModuleHandle, PackageImage};
use super::value::Value;
use crate::compile::Module;

struct LoadedPackage {
    label: String,
    exports: FxHashMap<String, Value>,
    natives: Vec<NativeLibrary>,
}

struct NativeLibrary {
    file_name: String,
    library: Library,
}

impl NativeLibrary {
    fn open(path: &str) -> Result<Self, String> {
        let file_name = Path::new(path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string());

        // SAFETY: the library comes from a resolved package; running its
        // initializers is what loading a native dependency means.
        let library = unsafe { Library::new(path) }
            .map_err(|e| format!("failed to load native library {}: {}", path, e))?;
        Ok(Self { file_name, library })
    }

    /// `native("geo", ...)` matches `libgeo.so`, `geo.dll` and the exact file name.
    fn matches(&self, name: &str) -> bool {
        if self.file_name == name {
            return true;
        }
        let stem = self
            .file_name
            .split('.')
            .next()
            .unwrap_or(&self.file_name);
        stem == name || stem.strip_prefix("lib") == Some(name)
    }

    fn has_symbol(&self, symbol: &str) -> bool {
        // SAFETY: the symbol is only looked up for presence, never called.
        unsafe { self.library.get::<*const ()>(symbol.as_bytes()) }.is_ok()
    }
}

/// Error from a member or native lookup, mapped to a fault by the runtime.
#[derive(Debug, PartialEq, Eq)]
pub enum LookupError {
    UnknownPackage(String),
    UnknownMember { package: String, member: String },
    UnknownLibrary(String),
}

#[derive(Default)]
pub struct IsolatedModuleLoader {
    packages: FxHashMap<String, LoadedPackage>,
    aliases: FxHashMap<String, String>,
    modules: FxHashMap<u64, Arc<Module>>,
    next_handle: u64,
}

impl IsolatedModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a module and the packages it needs. Nothing is committed unless
    /// everything loads.
    pub fn load(
        &mut self,
        bytes: &[u8],
        packages: Vec<PackageImage>,
    ) -> Result<ModuleHandle, String> {
        let module = Module::decode(bytes)?;

        let mut staged: Vec<(String, LoadedPackage)> = Vec::new();
        let mut aliases: Vec<(String, String)> = Vec::new();
        for image in packages {
            let key = image.key();
            if let Some(alias) = &image.alias {
                aliases.push((alias.clone(), key.clone()));
            }
            if self.packages.contains_key(&key) || staged.iter().any(|(k, _)| *k == key) {
                continue;
            }

            let natives = image
                .native_libraries
                .iter()
                .map(|path| NativeLibrary::open(path))
                .collect::<Result<Vec<_>, _>>()?;
            let exports = image
                .exports
                .iter()
                .map(|export| (export.name.clone(), Value::from(&export.value)))
                .collect();

            tracing::debug!("Loaded package {} from {}", key, image.location);
            staged.push((
                key,
                LoadedPackage {
                    label: format!("{} {}", image.name, image.version),
                    exports,
                    natives,
                },
            ));
        }

        for alias in &module.externs {
            let bound = self.aliases.contains_key(alias) || aliases.iter().any(|(a, _)| a == alias);
            if !bound {
                return Err(format!("package `{}` is not loaded in this context", alias));
            }
        }

        self.packages.extend(staged);
        self.aliases.extend(aliases);

        self.next_handle += 1;
        let handle = ModuleHandle(self.next_handle);
        self.modules.insert(handle.0, Arc::new(module));
        Ok(handle)
    }

    pub fn module(&self, handle: ModuleHandle) -> Option<Arc<Module>> {
        self.modules.get(&handle.0).cloned()
    }

    /// Export `member` of the package bound to `alias`.
    pub fn member(&self, alias: &str, member: &str) -> Result<Value, LookupError> {
        let package = self
            .aliases
            .get(alias)
            .and_then(|key| self.packages.get(key))
            .ok_or_else(|| LookupError::UnknownPackage(alias.to_string()))?;
        package
            .exports
            .get(member)
            .cloned()
            .ok_or_else(|| LookupError::UnknownMember {
                package: package.label.clone(),
                member: member.to_string(),
            })
    }

    /// Whether a loaded native library exports `symbol`.
    pub fn native_symbol(&self, library: &str, symbol: &str) -> Result<bool, LookupError> {
        let native = self
            .packages
            .values()
            .flat_map(|package| package.natives.iter())
            .find(|native| native.matches(library))
            .ok_or_else(|| LookupError::UnknownLibrary(library.to_string()))?;
        Ok(native.has_symbol(symbol))
    }

    pub fn package_count(&self) -> usize {
        self.packages.len()
    }

    /// Forget every module and package.
    pub fn reset(&mut self) {
        self.modules.clear();
        self.aliases.clear();
        self.packages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::{Constant, Instruction, MODULE_FORMAT};
    use crate::execute::types::Export;

    fn image(name: &str, version: &str, alias: Option<&str>, pi: i64) -> PackageImage {
        PackageImage {
            name: name.to_string(),
            version: version.to_string(),
            alias: alias.map(String::from),
            location: format!("/memory/{}/{}", name, version),
            exports: vec![Export {
                name: "pi".to_string(),
                value: Constant::Int(pi),
            }],
            native_libraries: vec![],
        }
    }

    fn module_reading(alias: &str) -> Vec<u8> {
        Module {
            format: MODULE_FORMAT,
            names: vec![alias.to_string(), "pi".to_string()],
            constants: vec![],
            code: vec![
                Instruction::LoadMember {
                    package: 0,
                    member: 1,
                },
                Instruction::Return,
            ],
            lines: vec![1, 1],
            externs: vec![alias.to_string()],
            has_result: true,
        }
        .encode()
        .unwrap()
    }

    #[test]
    fn test_versions_load_side_by_side() {
        let mut loader = IsolatedModuleLoader::new();
        loader
            .load(&module_reading("old"), vec![image("mathx", "1.0.0", Some("old"), 3)])
            .unwrap();
        loader
            .load(&module_reading("new"), vec![image("mathx", "2.0.0", Some("new"), 4)])
            .unwrap();

        assert_eq!(loader.package_count(), 2);
        assert_eq!(loader.member("old", "pi"), Ok(Value::Int(3)));
        assert_eq!(loader.member("new", "pi"), Ok(Value::Int(4)));
    }

    #[test]
    fn test_unbound_extern_fails_without_committing() {
        let mut loader = IsolatedModuleLoader::new();
        let err = loader
            .load(&module_reading("geo"), vec![image("mathx", "1.0.0", Some("mathx"), 3)])
            .unwrap_err();
        assert!(err.contains("`geo`"));
        assert_eq!(loader.package_count(), 0);
    }

    #[test]
    fn test_missing_native_is_load_failure() {
        let mut loader = IsolatedModuleLoader::new();
        let mut package = image("geo", "1.0.0", Some("geo"), 1);
        package.native_libraries = vec!["/nonexistent/libgeo_missing.so".to_string()];

        let err = loader.load(&module_reading("geo"), vec![package]).unwrap_err();
        assert!(err.contains("failed to load native library"));
        assert_eq!(loader.package_count(), 0);
    }

    #[test]
    fn test_unknown_member() {
        let mut loader = IsolatedModuleLoader::new();
        loader
            .load(&module_reading("m"), vec![image("mathx", "1.0.0", Some("m"), 3)])
            .unwrap();
        assert_eq!(
            loader.member("m", "tau"),
            Err(LookupError::UnknownMember {
                package: "mathx 1.0.0".to_string(),
                member: "tau".to_string(),
            })
        );
        assert_eq!(
            loader.native_symbol("geo", "area"),
            Err(LookupError::UnknownLibrary("geo".to_string()))
        );
    }
}
