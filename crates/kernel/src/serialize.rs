//! Persisted module format: a length-free sequence of tagged records,
//! bracketed by the `oleanfile` header and the `EndFile` terminator.

use crate::builtin::lookup_builtin;
use crate::env::{Environment, Object};
use crate::error::KernelError;
use crate::expr::*;
use crate::level::{mk_max_of, mk_uvar, Level, LevelData};
use crate::name::{mk_anon, Name, NameData, NameExt};

const HEADER: &str = "oleanfile";
const END_FILE: &str = "EndFile";
const VERSION_MAJOR: u32 = 0;
const VERSION_MINOR: u32 = 1;

fn corrupt(detail: impl Into<String>) -> KernelError {
    KernelError::Corrupt { detail: detail.into() }
}

fn put_u8(x: u8, buf: &mut Vec<u8>) {
    buf.push(x);
}

fn get_u8(buf: &mut &[u8]) -> Result<u8, KernelError> {
    match buf.split_first() {
        Some((&x, rest)) => {
            *buf = rest;
            Ok(x)
        }
        None => Err(corrupt("unexpected end of input")),
    }
}

fn put_u64(mut x: u64, buf: &mut Vec<u8>) {
    loop {
        let byte = (x & 0x7f) as u8;
        x >>= 7;
        if x == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn get_u64(buf: &mut &[u8]) -> Result<u64, KernelError> {
    let mut result: u64 = 0;
    let mut shift = 0;
    loop {
        let byte = get_u8(buf)?;
        if shift >= 64 {
            return Err(corrupt("varint overflow"));
        }
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}

fn put_usize(x: usize, buf: &mut Vec<u8>) {
    put_u64(x as u64, buf);
}

fn get_usize(buf: &mut &[u8]) -> Result<usize, KernelError> {
    Ok(get_u64(buf)? as usize)
}

fn put_bool(x: bool, buf: &mut Vec<u8>) {
    put_u8(u8::from(x), buf);
}

fn get_bool(buf: &mut &[u8]) -> Result<bool, KernelError> {
    match get_u8(buf)? {
        0 => Ok(false),
        1 => Ok(true),
        x => Err(corrupt(format!("invalid bool {}", x))),
    }
}

fn put_str(s: &str, buf: &mut Vec<u8>) {
    put_usize(s.len(), buf);
    buf.extend_from_slice(s.as_bytes());
}

fn get_str(buf: &mut &[u8]) -> Result<String, KernelError> {
    let len = get_usize(buf)?;
    if buf.len() < len {
        return Err(corrupt("string runs past end of input"));
    }
    let (bytes, rest) = buf.split_at(len);
    *buf = rest;
    String::from_utf8(bytes.to_vec()).map_err(|_| corrupt("invalid utf-8"))
}

fn put_name(n: &Name, buf: &mut Vec<u8>) {
    match &**n {
        NameData::Anon => put_u8(0, buf),
        NameData::Str { parent, part } => {
            put_u8(1, buf);
            put_name(parent, buf);
            put_str(part.as_ref(), buf);
        }
        NameData::Num { parent, part } => {
            put_u8(2, buf);
            put_name(parent, buf);
            put_u64(*part, buf);
        }
    }
}

fn get_name(buf: &mut &[u8]) -> Result<Name, KernelError> {
    match get_u8(buf)? {
        0 => Ok(mk_anon()),
        1 => {
            let parent = get_name(buf)?;
            let part = get_str(buf)?;
            Ok(parent.str(part))
        }
        2 => {
            let parent = get_name(buf)?;
            let part = get_u64(buf)?;
            Ok(parent.num(part))
        }
        tag => Err(corrupt(format!("unknown name tag {}", tag))),
    }
}

fn put_level(l: &Level, buf: &mut Vec<u8>) {
    match &**l {
        LevelData::UVar(name) => {
            put_u8(0, buf);
            put_name(name, buf);
        }
        LevelData::Lift { base, offset } => {
            put_u8(1, buf);
            put_level(base, buf);
            put_u64(u64::from(*offset), buf);
        }
        LevelData::Max(children) => {
            put_u8(2, buf);
            put_usize(children.len(), buf);
            for c in children {
                put_level(c, buf);
            }
        }
    }
}

fn get_level(buf: &mut &[u8]) -> Result<Level, KernelError> {
    match get_u8(buf)? {
        0 => Ok(mk_uvar(get_name(buf)?)),
        1 => {
            let base = get_level(buf)?;
            let offset = get_u64(buf)?;
            Ok(crate::level::LevelExt::add(&base, offset as u32))
        }
        2 => {
            let len = get_usize(buf)?;
            let mut children = Vec::with_capacity(len.min(buf.len()));
            for _ in 0..len {
                children.push(get_level(buf)?);
            }
            Ok(mk_max_of(children))
        }
        tag => Err(corrupt(format!("unknown level tag {}", tag))),
    }
}

fn put_expr(e: &Expr, buf: &mut Vec<u8>) -> Result<(), KernelError> {
    match &e.data {
        ExprData::Var(i) => {
            put_u8(0, buf);
            put_usize(*i, buf);
        }
        ExprData::Constant { name, levels, .. } => {
            // The cached type is session-local and never persisted.
            put_u8(1, buf);
            put_name(name, buf);
            put_usize(levels.len(), buf);
            for l in levels {
                put_level(l, buf);
            }
        }
        ExprData::Type(l) => {
            put_u8(2, buf);
            put_level(l, buf);
        }
        ExprData::Value(v) => {
            put_u8(3, buf);
            put_name(&v.name(), buf);
        }
        ExprData::App(args) => {
            put_u8(4, buf);
            put_usize(args.len(), buf);
            for a in args {
                put_expr(a, buf)?;
            }
        }
        ExprData::Lambda { name, domain, body } => {
            put_u8(5, buf);
            put_name(name, buf);
            put_expr(domain, buf)?;
            put_expr(body, buf)?;
        }
        ExprData::Pi { name, domain, body } => {
            put_u8(6, buf);
            put_name(name, buf);
            put_expr(domain, buf)?;
            put_expr(body, buf)?;
        }
        ExprData::Eq { lhs, rhs } => {
            put_u8(7, buf);
            put_expr(lhs, buf)?;
            put_expr(rhs, buf)?;
        }
        ExprData::Let { name, ty, value, body } => {
            put_u8(8, buf);
            put_name(name, buf);
            match ty {
                Some(t) => {
                    put_bool(true, buf);
                    put_expr(t, buf)?;
                }
                None => put_bool(false, buf),
            }
            put_expr(value, buf)?;
            put_expr(body, buf)?;
        }
        ExprData::MetaVar { .. } => {
            return Err(corrupt("metavariables cannot be persisted"));
        }
    }
    Ok(())
}

fn get_expr(buf: &mut &[u8]) -> Result<Expr, KernelError> {
    match get_u8(buf)? {
        0 => Ok(mk_var(get_usize(buf)?)),
        1 => {
            let name = get_name(buf)?;
            let len = get_usize(buf)?;
            let mut levels = Vec::with_capacity(len.min(buf.len()));
            for _ in 0..len {
                levels.push(get_level(buf)?);
            }
            Ok(mk_constant_with(name, None, levels))
        }
        2 => Ok(mk_type(get_level(buf)?)),
        3 => {
            let name = get_name(buf)?;
            match lookup_builtin(&name) {
                Some(v) => Ok(mk_value(v)),
                None => Err(corrupt(format!("unknown builtin '{}'", name))),
            }
        }
        4 => {
            let len = get_usize(buf)?;
            if len < 2 {
                return Err(corrupt("application with fewer than two parts"));
            }
            let mut args = Vec::with_capacity(len.min(buf.len()));
            for _ in 0..len {
                args.push(get_expr(buf)?);
            }
            Ok(mk_app(args))
        }
        5 => {
            let name = get_name(buf)?;
            let domain = get_expr(buf)?;
            let body = get_expr(buf)?;
            Ok(mk_lambda(name, domain, body))
        }
        6 => {
            let name = get_name(buf)?;
            let domain = get_expr(buf)?;
            let body = get_expr(buf)?;
            Ok(mk_pi(name, domain, body))
        }
        7 => {
            let lhs = get_expr(buf)?;
            let rhs = get_expr(buf)?;
            Ok(mk_eq(lhs, rhs))
        }
        8 => {
            let name = get_name(buf)?;
            let ty = if get_bool(buf)? { Some(get_expr(buf)?) } else { None };
            let value = get_expr(buf)?;
            let body = get_expr(buf)?;
            Ok(mk_let(name, ty, value, body))
        }
        tag => Err(corrupt(format!("unknown expression tag {}", tag))),
    }
}

fn put_object(obj: &Object, buf: &mut Vec<u8>) -> Result<(), KernelError> {
    match obj {
        Object::Axiom { name, ty } => {
            put_str("Ax", buf);
            put_name(name, buf);
            put_expr(ty, buf)?;
        }
        Object::Variable { name, ty } => {
            put_str("Var", buf);
            put_name(name, buf);
            put_expr(ty, buf)?;
        }
        Object::Definition { name, ty, value, weight, opaque } => {
            put_str("Def", buf);
            put_name(name, buf);
            put_expr(ty, buf)?;
            put_expr(value, buf)?;
            put_u64(u64::from(*weight), buf);
            put_bool(*opaque, buf);
        }
        Object::Theorem { name, ty, value } => {
            put_str("Th", buf);
            put_name(name, buf);
            put_expr(ty, buf)?;
            put_expr(value, buf)?;
        }
        Object::Builtin { value } => {
            put_str("Bltn", buf);
            put_name(&value.name(), buf);
        }
        Object::UVarCnstr { name, level } => {
            put_str("Univ", buf);
            put_name(name, buf);
            put_level(level, buf);
        }
    }
    Ok(())
}

fn get_object(keyword: &str, buf: &mut &[u8]) -> Result<Object, KernelError> {
    match keyword {
        "Ax" => {
            let name = get_name(buf)?;
            let ty = get_expr(buf)?;
            Ok(Object::Axiom { name, ty })
        }
        "Var" => {
            let name = get_name(buf)?;
            let ty = get_expr(buf)?;
            Ok(Object::Variable { name, ty })
        }
        "Def" => {
            let name = get_name(buf)?;
            let ty = get_expr(buf)?;
            let value = get_expr(buf)?;
            let weight = get_u64(buf)? as u32;
            let opaque = get_bool(buf)?;
            Ok(Object::Definition { name, ty, value, weight, opaque })
        }
        "Th" => {
            let name = get_name(buf)?;
            let ty = get_expr(buf)?;
            let value = get_expr(buf)?;
            Ok(Object::Theorem { name, ty, value })
        }
        "Bltn" => {
            let name = get_name(buf)?;
            match lookup_builtin(&name) {
                Some(value) => Ok(Object::Builtin { value }),
                None => Err(corrupt(format!("unknown builtin '{}'", name))),
            }
        }
        "Univ" => {
            let name = get_name(buf)?;
            let level = get_level(buf)?;
            Ok(Object::UVarCnstr { name, level })
        }
        other => Err(corrupt(format!("unknown record '{}'", other))),
    }
}

/// Serialize every declaration of `env` (ancestors included) in insertion
/// order.
pub fn export_objects(env: &Environment) -> Result<Vec<u8>, KernelError> {
    let mut buf = Vec::new();
    put_str(HEADER, &mut buf);
    put_u64(u64::from(VERSION_MAJOR), &mut buf);
    put_u64(u64::from(VERSION_MINOR), &mut buf);
    for obj in env.objects() {
        put_object(&obj, &mut buf)?;
    }
    put_str(END_FILE, &mut buf);
    Ok(buf)
}

/// Read a module back into a fresh environment. Imported declarations are
/// trusted (not re-checked).
pub fn import_objects(bytes: &[u8]) -> Result<Environment, KernelError> {
    let mut buf = bytes;
    let header = get_str(&mut buf)?;
    if header != HEADER {
        return Err(corrupt("not a module file"));
    }
    let _major = get_u64(&mut buf)?;
    let _minor = get_u64(&mut buf)?;
    let env = Environment::new();
    loop {
        let keyword = get_str(&mut buf)?;
        if keyword == END_FILE {
            return Ok(env);
        }
        let obj = get_object(&keyword, &mut buf)?;
        env.import_object(obj)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin;
    use crate::level::{bottom, LevelExt};
    use crate::name::mk_name;

    fn sample_env() -> Environment {
        let env = Environment::new();
        let bool_v = builtin::value_of(&builtin::bool_type()).expect("value").clone();
        env.add_builtin(bool_v).expect("Bool");
        env.add_uvar_cnstr(mk_name("u"), bottom().add(1)).expect("u");
        env.add_var(mk_name("T"), mk_type(bottom())).expect("T");
        let t = mk_constant(mk_name("T"));
        env.add_var(mk_name("a"), t.clone()).expect("a");
        let id_ty = mk_pi(mk_name("x"), t.clone(), crate::subst::lift_free_vars(&t, 0, 1, None));
        let id = mk_lambda(mk_name("x"), t.clone(), mk_var(0));
        env.add_definition(mk_name("id"), id_ty, id, false).expect("id");
        env.add_axiom(mk_name("em"), builtin::bool_type()).expect("em");
        env
    }

    #[test]
    fn environments_round_trip() -> anyhow::Result<()> {
        let env = sample_env();
        let bytes = export_objects(&env)?;
        let reread = import_objects(&bytes)?;
        assert_eq!(env.objects(), reread.objects());
        // The reread store answers the same universe queries.
        let u = mk_uvar(mk_name("u"));
        assert!(reread.is_ge(&u, &bottom().add(1)));
        assert!(!reread.is_ge(&bottom(), &u));
        Ok(())
    }

    #[test]
    fn truncated_input_is_rejected() {
        let env = sample_env();
        let bytes = export_objects(&env).expect("export");
        let result = import_objects(&bytes[..bytes.len() - 4]);
        assert!(matches!(result, Err(KernelError::Corrupt { .. })));
    }

    #[test]
    fn metavariables_do_not_persist() {
        let mut buf = Vec::new();
        let m = mk_metavar(mk_name("m"), LocalContext::new());
        assert!(matches!(put_expr(&m, &mut buf), Err(KernelError::Corrupt { .. })));
    }
}
