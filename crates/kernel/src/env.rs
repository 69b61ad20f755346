
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use ahash::AHashMap;
use once_cell::sync::Lazy;

use crate::error::KernelError;
use crate::expr::{Expr, ExprData, SemanticValue};
use crate::infer;
use crate::level::{bottom, mk_uvar, Level};
use crate::name::Name;
use crate::universe::UniverseConstraints;

/// A declared entity, in insertion order.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Axiom { name: Name, ty: Expr },
    Variable { name: Name, ty: Expr },
    Definition { name: Name, ty: Expr, value: Expr, weight: u32, opaque: bool },
    Theorem { name: Name, ty: Expr, value: Expr },
    Builtin { value: SemanticValue },
    UVarCnstr { name: Name, level: Level },
}

impl Object {
    pub fn name(&self) -> Name {
        match self {
            Object::Axiom { name, .. }
            | Object::Variable { name, .. }
            | Object::Definition { name, .. }
            | Object::Theorem { name, .. }
            | Object::UVarCnstr { name, .. } => name.clone(),
            Object::Builtin { value } => value.name(),
        }
    }

    pub fn ty(&self) -> Option<Expr> {
        match self {
            Object::Axiom { ty, .. }
            | Object::Variable { ty, .. }
            | Object::Definition { ty, .. }
            | Object::Theorem { ty, .. } => Some(ty.clone()),
            Object::Builtin { value } => Some(value.ty()),
            Object::UVarCnstr { .. } => None,
        }
    }

    pub fn is_definition(&self) -> bool {
        matches!(self, Object::Definition { .. })
    }

    pub fn is_opaque(&self) -> bool {
        match self {
            Object::Definition { opaque, .. } => *opaque,
            _ => false,
        }
    }

    pub fn value(&self) -> Option<Expr> {
        match self {
            Object::Definition { value, .. } | Object::Theorem { value, .. } => {
                Some(value.clone())
            }
            _ => None,
        }
    }

    pub fn weight(&self) -> u32 {
        match self {
            Object::Definition { weight, .. } => *weight,
            _ => 0,
        }
    }
}

/// An environment extension instance. Extensions manage their own interior
/// mutability; the environment only owns the slot.
pub type Extension = Arc<dyn Any + Send + Sync>;

type MkExtension = fn() -> Extension;

static EXTENSION_FACTORIES: Lazy<Mutex<Vec<MkExtension>>> =
    Lazy::new(|| Mutex::new(Vec::new()));

/// Register a factory for an extension kind and obtain its process-wide id.
/// The table is insertion-only.
pub fn register_extension(mk: MkExtension) -> usize {
    let mut factories = EXTENSION_FACTORIES.lock().expect("extension registry poisoned");
    factories.push(mk);
    factories.len() - 1
}

fn mk_extension(extid: usize) -> Option<Extension> {
    let factories = EXTENSION_FACTORIES.lock().expect("extension registry poisoned");
    factories.get(extid).map(|mk| mk())
}

#[derive(Debug, Default)]
struct EnvState {
    objects: Vec<Object>,
    by_name: AHashMap<Name, usize>,
    uvars: Vec<Level>,
    ucs: UniverseConstraints,
}

struct EnvCell {
    parent: Option<Environment>,
    state: RwLock<EnvState>,
    num_children: AtomicUsize,
    extensions: Mutex<Vec<Option<Extension>>>,
}

impl fmt::Debug for EnvCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvCell")
            .field("parent", &self.parent.is_some())
            .field("num_children", &self.num_children)
            .finish()
    }
}

impl Drop for EnvCell {
    fn drop(&mut self) {
        if let Some(parent) = &self.parent {
            parent.cell.num_children.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// An append-only tree of declarations. A parent with live children is
/// read-only; reads take a shared lock, writes an exclusive one.
#[derive(Debug, Clone)]
pub struct Environment {
    cell: Arc<EnvCell>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    pub fn new() -> Environment {
        let env = Environment {
            cell: Arc::new(EnvCell {
                parent: None,
                state: RwLock::new(EnvState::default()),
                num_children: AtomicUsize::new(0),
                extensions: Mutex::new(Vec::new()),
            }),
        };
        env.init_uvars();
        env
    }

    fn init_uvars(&self) {
        let mut state = self.write_state();
        let bot = bottom();
        if let Some(name) = level_name(&bot) {
            state.ucs.add_var(name);
        }
        state.uvars.push(bot);
    }

    pub fn mk_child(&self) -> Environment {
        self.cell.num_children.fetch_add(1, Ordering::SeqCst);
        Environment {
            cell: Arc::new(EnvCell {
                parent: Some(self.clone()),
                state: RwLock::new(EnvState::default()),
                num_children: AtomicUsize::new(0),
                extensions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The extension instance with the given registered id, created on
    /// first use. Returns `None` for an unregistered id.
    pub fn extension(&self, extid: usize) -> Option<Extension> {
        let mut slots = self.cell.extensions.lock().expect("extension slots poisoned");
        if slots.len() <= extid {
            slots.resize(extid + 1, None);
        }
        if slots[extid].is_none() {
            slots[extid] = mk_extension(extid);
        }
        slots[extid].clone()
    }

    pub fn has_parent(&self) -> bool {
        self.cell.parent.is_some()
    }

    pub fn has_children(&self) -> bool {
        self.cell.num_children.load(Ordering::SeqCst) > 0
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, EnvState> {
        self.cell.state.read().expect("environment lock poisoned")
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, EnvState> {
        self.cell.state.write().expect("environment lock poisoned")
    }

    fn check_writable(&self) -> Result<(), KernelError> {
        if self.has_children() {
            Err(KernelError::ReadOnlyEnvironment)
        } else {
            Ok(())
        }
    }

    fn check_name(&self, name: &Name) -> Result<(), KernelError> {
        self.check_writable()?;
        let mut current = Some(self.clone());
        while let Some(env) = current {
            if env.read_state().by_name.contains_key(name) {
                return Err(KernelError::AlreadyDeclared { name: name.clone() });
            }
            current = env.cell.parent.clone();
        }
        Ok(())
    }

    fn register(&self, object: Object) {
        let mut state = self.write_state();
        let idx = state.objects.len();
        state.by_name.insert(object.name(), idx);
        state.objects.push(object);
    }

    /// The object named `name`, if declared here or in an ancestor.
    pub fn find_object(&self, name: &Name) -> Option<Object> {
        let state = self.read_state();
        match state.by_name.get(name) {
            Some(idx) => state.objects.get(*idx).cloned(),
            None => {
                drop(state);
                self.cell.parent.as_ref().and_then(|p| p.find_object(name))
            }
        }
    }

    pub fn get_object(&self, name: &Name) -> Result<Object, KernelError> {
        self.find_object(name)
            .ok_or_else(|| KernelError::UnknownObject { name: name.clone() })
    }

    /// All declarations, parents first, in insertion order.
    pub fn objects(&self) -> Vec<Object> {
        let mut result = match &self.cell.parent {
            Some(parent) => parent.objects(),
            None => Vec::new(),
        };
        result.extend(self.read_state().objects.iter().cloned());
        result
    }

    pub fn num_objects(&self) -> usize {
        let parents = self.cell.parent.as_ref().map_or(0, |p| p.num_objects());
        parents + self.read_state().objects.len()
    }

    /// Weight of a definition: one more than the heaviest definition it
    /// references.
    pub fn get_max_weight(&self, e: &Expr) -> u32 {
        match &e.data {
            ExprData::Constant { name, .. } => {
                self.find_object(name).map_or(0, |obj| obj.weight())
            }
            ExprData::App(args) => {
                args.iter().map(|a| self.get_max_weight(a)).max().unwrap_or(0)
            }
            ExprData::Lambda { domain, body, .. } | ExprData::Pi { domain, body, .. } => {
                self.get_max_weight(domain).max(self.get_max_weight(body))
            }
            ExprData::Eq { lhs, rhs } => {
                self.get_max_weight(lhs).max(self.get_max_weight(rhs))
            }
            ExprData::Let { ty, value, body, .. } => {
                let t = ty.as_ref().map_or(0, |t| self.get_max_weight(t));
                t.max(self.get_max_weight(value)).max(self.get_max_weight(body))
            }
            _ => 0,
        }
    }

    /// The kernel does not accept expressions carrying cached constant
    /// types: a stale cache could smuggle in an ill-typed term.
    fn check_no_cached_type(&self, e: &Expr) -> Result<(), KernelError> {
        match &e.data {
            ExprData::Constant { ty: Some(_), .. } => {
                Err(KernelError::TypeExpected { expr: e.clone() })
            }
            ExprData::Constant { .. } => Ok(()),
            ExprData::App(args) => {
                args.iter().try_for_each(|a| self.check_no_cached_type(a))
            }
            ExprData::Lambda { domain, body, .. } | ExprData::Pi { domain, body, .. } => {
                self.check_no_cached_type(domain)?;
                self.check_no_cached_type(body)
            }
            ExprData::Eq { lhs, rhs } => {
                self.check_no_cached_type(lhs)?;
                self.check_no_cached_type(rhs)
            }
            ExprData::Let { ty, value, body, .. } => {
                if let Some(t) = ty {
                    self.check_no_cached_type(t)?;
                }
                self.check_no_cached_type(value)?;
                self.check_no_cached_type(body)
            }
            _ => Ok(()),
        }
    }

    pub fn add_axiom(&self, name: Name, ty: Expr) -> Result<(), KernelError> {
        self.check_no_cached_type(&ty)?;
        self.check_name(&name)?;
        infer::check_is_type(self, &ty)?;
        self.register(Object::Axiom { name, ty });
        Ok(())
    }

    pub fn add_var(&self, name: Name, ty: Expr) -> Result<(), KernelError> {
        self.check_no_cached_type(&ty)?;
        self.check_name(&name)?;
        infer::check_is_type(self, &ty)?;
        self.register(Object::Variable { name, ty });
        Ok(())
    }

    pub fn add_definition(&self, name: Name, ty: Expr, value: Expr, opaque: bool) -> Result<(), KernelError> {
        self.check_no_cached_type(&ty)?;
        self.check_no_cached_type(&value)?;
        self.check_name(&name)?;
        infer::check_definition(self, &name, &ty, &value)?;
        let weight = self.get_max_weight(&value) + 1;
        self.register(Object::Definition { name, ty, value, weight, opaque });
        Ok(())
    }

    /// Add a definition without type checking, trusting the caller. Used by
    /// module import.
    pub fn add_definition_unchecked(&self, name: Name, ty: Expr, value: Expr, opaque: bool) -> Result<(), KernelError> {
        self.check_name(&name)?;
        let weight = self.get_max_weight(&value) + 1;
        self.register(Object::Definition { name, ty, value, weight, opaque });
        Ok(())
    }

    pub fn add_theorem(&self, name: Name, ty: Expr, value: Expr) -> Result<(), KernelError> {
        self.check_no_cached_type(&ty)?;
        self.check_no_cached_type(&value)?;
        self.check_name(&name)?;
        infer::check_definition(self, &name, &ty, &value)?;
        self.register(Object::Theorem { name, ty, value });
        Ok(())
    }

    pub fn add_theorem_unchecked(&self, name: Name, ty: Expr, value: Expr) -> Result<(), KernelError> {
        self.check_name(&name)?;
        self.register(Object::Theorem { name, ty, value });
        Ok(())
    }

    pub fn add_builtin(&self, value: SemanticValue) -> Result<(), KernelError> {
        self.check_name(&value.name())?;
        self.register(Object::Builtin { value });
        Ok(())
    }

    pub fn set_opaque(&self, name: &Name, flag: bool) -> Result<(), KernelError> {
        self.check_writable()?;
        let mut state = self.write_state();
        match state.by_name.get(name).copied() {
            Some(idx) => match state.objects.get_mut(idx) {
                Some(Object::Definition { opaque, .. }) => {
                    *opaque = flag;
                    Ok(())
                }
                _ => Err(KernelError::UnknownObject { name: name.clone() }),
            },
            None => Err(KernelError::UnknownObject { name: name.clone() }),
        }
    }

    /// Declare universe variable `name` with constraint `name >= level`.
    pub fn add_uvar_cnstr(&self, name: Name, level: Level) -> Result<Level, KernelError> {
        self.check_name(&name)?;
        let mut state = self.write_state();
        state.ucs.check_level_consistency(&name, &level, 0)?;
        state.ucs.add_var(name.clone());
        let fresh = mk_uvar(name.clone());
        state.uvars.push(fresh.clone());
        state.ucs.add_level_constraint(&name, &level, 0);
        let idx = state.objects.len();
        state.by_name.insert(name.clone(), idx);
        state.objects.push(Object::UVarCnstr { name, level });
        Ok(fresh)
    }

    /// Install an object read back from a module, trusting its checks.
    pub(crate) fn import_object(&self, object: Object) -> Result<(), KernelError> {
        match object {
            Object::UVarCnstr { name, level } => {
                self.add_uvar_cnstr(name, level).map(|_| ())
            }
            object => {
                self.check_name(&object.name())?;
                self.register(object);
                Ok(())
            }
        }
    }

    pub fn get_uvar(&self, name: &Name) -> Result<Level, KernelError> {
        let state = self.read_state();
        let found = state.uvars.iter().find(|u| **u == mk_uvar(name.clone())).cloned();
        drop(state);
        match found {
            Some(level) => Ok(level),
            None => match &self.cell.parent {
                Some(parent) => parent.get_uvar(name),
                None => Err(KernelError::UnknownUniverse { name: name.clone() }),
            },
        }
    }

    /// Is `l1 >= l2 + k` implied by the declared universe constraints?
    pub fn is_ge_k(&self, l1: &Level, l2: &Level, k: i64) -> bool {
        // Constraints accumulate down the tree; each level of the tree has
        // its own store, so query the nearest one that knows the variables.
        let state = self.read_state();
        if state.ucs.is_ge(l1, l2, k) {
            return true;
        }
        drop(state);
        self.cell.parent.as_ref().map_or(false, |p| p.is_ge_k(l1, l2, k))
    }

    pub fn is_ge(&self, l1: &Level, l2: &Level) -> bool {
        self.is_ge_k(l1, l2, 0)
    }
}

fn level_name(level: &Level) -> Option<Name> {
    match &**level {
        crate::level::LevelData::UVar(name) => Some(name.clone()),
        _ => None,
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for obj in self.objects() {
            match &obj {
                Object::Axiom { name, ty } => writeln!(f, "axiom {} : {}", name, ty)?,
                Object::Variable { name, ty } => writeln!(f, "variable {} : {}", name, ty)?,
                Object::Definition { name, ty, value, opaque, .. } => {
                    let kw = if *opaque { "opaque definition" } else { "definition" };
                    writeln!(f, "{} {} : {} := {}", kw, name, ty, value)?;
                }
                Object::Theorem { name, ty, .. } => writeln!(f, "theorem {} : {}", name, ty)?,
                Object::Builtin { value } => writeln!(f, "builtin {}", value)?,
                Object::UVarCnstr { name, level } => {
                    writeln!(f, "universe {} >= {}", name, level)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin;
    use crate::expr::{mk_constant, mk_type};
    use crate::name::mk_name;

    #[test]
    fn declarations_round_trip() {
        let env = Environment::new();
        env.add_var(mk_name("T"), mk_type(bottom())).expect("add T");
        let t = mk_constant(mk_name("T"));
        env.add_var(mk_name("a"), t.clone()).expect("add a");
        let obj = env.get_object(&mk_name("a")).expect("lookup");
        assert_eq!(obj.ty(), Some(t));
        assert!(matches!(
            env.add_var(mk_name("a"), mk_type(bottom())),
            Err(KernelError::AlreadyDeclared { .. })
        ));
        assert!(matches!(
            env.get_object(&mk_name("zzz")),
            Err(KernelError::UnknownObject { .. })
        ));
    }

    #[test]
    fn children_freeze_parents() {
        let env = Environment::new();
        let child = env.mk_child();
        assert!(matches!(
            env.add_var(mk_name("T"), mk_type(bottom())),
            Err(KernelError::ReadOnlyEnvironment)
        ));
        child.add_var(mk_name("T"), mk_type(bottom())).expect("child is writable");
        drop(child);
        env.add_var(mk_name("T"), mk_type(bottom())).expect("writable again");
    }

    #[test]
    fn extensions_are_created_on_demand() {
        use std::sync::Mutex as StdMutex;
        fn mk() -> Extension {
            Arc::new(StdMutex::new(0_u32))
        }
        let extid = register_extension(mk);
        let env = Environment::new();
        let ext = env.extension(extid).expect("registered");
        let counter = ext.downcast_ref::<StdMutex<u32>>().expect("downcast");
        *counter.lock().expect("lock") += 1;
        // The same slot is returned on the next access.
        let again = env.extension(extid).expect("registered");
        let counter = again.downcast_ref::<StdMutex<u32>>().expect("downcast");
        assert_eq!(*counter.lock().expect("lock"), 1);
        assert!(env.extension(extid + 1000).is_none());
    }

    #[test]
    fn builtins_are_objects() {
        let env = Environment::new();
        let v = builtin::value_of(&builtin::bool_type()).expect("value").clone();
        env.add_builtin(v).expect("add builtin");
        let obj = env.get_object(&mk_name("Bool")).expect("lookup");
        assert!(matches!(obj, Object::Builtin { .. }));
    }
}
