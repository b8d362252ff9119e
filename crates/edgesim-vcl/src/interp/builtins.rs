//! Builtin function registry. Each entry declares where it may be called,
//! its arity and which arguments are passed as bare identifiers.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration as StdDuration;

use edgesim_rt::bytes::{self, Alphabet};
use hmac::{Hmac, Mac};
use regex::Regex;
use sha2::{Digest, Sha256};

use super::{Context, Interpreter, Scope, ScopeSet};
use crate::coverage::CoverageKind;
use crate::value::{Value, ValueKind};

type BuiltinFn = fn(&Interpreter, &mut Context, &[Value]) -> Result<Value, String>;

pub(super) struct Builtin {
    pub scopes: ScopeSet,
    pub min_args: usize,
    pub max_args: usize,
    /// Positions passed textually as identifiers rather than evaluated.
    pub ident_args: &'static [usize],
    pub call: BuiltinFn,
}

const fn builtin(
    min_args: usize,
    max_args: usize,
    ident_args: &'static [usize],
    call: BuiltinFn,
) -> Builtin {
    Builtin {
        scopes: ScopeSet::ALL,
        min_args,
        max_args,
        ident_args,
        call,
    }
}

const fn scoped(scopes: ScopeSet, mut entry: Builtin) -> Builtin {
    entry.scopes = scopes;
    entry
}

const PUSH_SCOPES: ScopeSet = ScopeSet::of(&[Scope::Recv, Scope::Deliver]);

static REGISTRY: OnceLock<HashMap<&'static str, Builtin>> = OnceLock::new();

pub(super) fn lookup(name: &str) -> Option<&'static Builtin> {
    REGISTRY.get_or_init(registry).get(name)
}

fn registry() -> HashMap<&'static str, Builtin> {
    HashMap::from([
        ("std.tolower", builtin(1, 1, &[], std_tolower)),
        ("std.toupper", builtin(1, 1, &[], std_toupper)),
        ("std.strlen", builtin(1, 1, &[], std_strlen)),
        ("std.atoi", builtin(1, 1, &[], std_atoi)),
        ("std.itoa", builtin(1, 2, &[], std_itoa)),
        ("std.prefixof", builtin(2, 2, &[], std_prefixof)),
        ("std.suffixof", builtin(2, 2, &[], std_suffixof)),
        ("std.strstr", builtin(2, 2, &[], std_strstr)),
        ("std.replaceall", builtin(3, 3, &[], std_replaceall)),
        ("std.collect", builtin(1, 2, &[0], std_collect)),
        ("regsub", builtin(3, 3, &[], regsub)),
        ("regsuball", builtin(3, 3, &[], regsuball)),
        ("substr", builtin(2, 3, &[], substr)),
        ("urlencode", builtin(1, 1, &[], urlencode)),
        ("urldecode", builtin(1, 1, &[], urldecode)),
        ("table.lookup", builtin(2, 3, &[0], table_lookup)),
        ("table.contains", builtin(2, 2, &[0], table_contains)),
        (
            "ratelimit.ratecounter_increment",
            builtin(3, 3, &[0], ratecounter_increment),
        ),
        ("ratelimit.check_rate", builtin(7, 7, &[1, 5], check_rate)),
        ("ratelimit.penaltybox_add", builtin(3, 3, &[0], penaltybox_add)),
        ("ratelimit.penaltybox_has", builtin(2, 2, &[0], penaltybox_has)),
        ("digest.hash_sha256", builtin(1, 1, &[], hash_sha256)),
        ("digest.hmac_sha256", builtin(2, 2, &[], hmac_sha256)),
        ("digest.base64", builtin(1, 1, &[], base64)),
        ("digest.base64url", builtin(1, 1, &[], base64url)),
        ("digest.base64_decode", builtin(1, 1, &[], base64_decode)),
        ("randomstr", builtin(1, 2, &[], randomstr)),
        ("time.add", builtin(2, 2, &[], time_add)),
        ("time.sub", builtin(2, 2, &[], time_sub)),
        ("header.get", builtin(2, 2, &[0], header_get)),
        ("header.set", builtin(3, 3, &[0], header_set)),
        ("header.unset", builtin(2, 2, &[0], header_unset)),
        ("h2.push", scoped(PUSH_SCOPES, builtin(1, 2, &[], h2_push))),
        ("coverage.subroutine", builtin(1, 1, &[], coverage_subroutine)),
        ("coverage.statement", builtin(1, 1, &[], coverage_statement)),
        ("coverage.branch", builtin(1, 1, &[], coverage_branch)),
        ("math.is_finite", builtin(1, 1, &[], math_is_finite)),
        ("std.str2float", builtin(1, 1, &[], std_str2float)),
    ])
}

fn text(args: &[Value], idx: usize) -> String {
    args.get(idx).map(Value::render).unwrap_or_default()
}

fn ident(args: &[Value], idx: usize) -> Result<&str, String> {
    match args.get(idx).map(|value| &value.kind) {
        Some(ValueKind::Ident(name)) => Ok(name),
        _ => Err(format!("argument {} must be an identifier", idx + 1)),
    }
}

fn integer(args: &[Value], idx: usize) -> Result<i64, String> {
    args.get(idx)
        .and_then(Value::as_int)
        .ok_or_else(|| format!("argument {} must be INTEGER", idx + 1))
}

fn rtime(args: &[Value], idx: usize) -> Result<i64, String> {
    match args.get(idx).map(|value| &value.kind) {
        Some(ValueKind::RTime(ms)) => Ok(*ms),
        _ => Err(format!("argument {} must be RTIME", idx + 1)),
    }
}

fn std_duration(ms: i64) -> StdDuration {
    StdDuration::from_millis(u64::try_from(ms).unwrap_or(0))
}

fn std_tolower(_: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    Ok(Value::string(text(args, 0).to_lowercase()))
}

fn std_toupper(_: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    Ok(Value::string(text(args, 0).to_uppercase()))
}

fn std_strlen(_: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    Ok(Value::int(text(args, 0).chars().count() as i64))
}

/// Leading decimal integer, `0` when there is none.
fn std_atoi(_: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    let raw = text(args, 0);
    let trimmed = raw.trim_start();
    let end = trimmed
        .char_indices()
        .find(|(idx, ch)| !(ch.is_ascii_digit() || (*idx == 0 && (*ch == '-' || *ch == '+'))))
        .map(|(idx, _)| idx)
        .unwrap_or(trimmed.len());
    Ok(Value::int(trimmed[..end].parse().unwrap_or(0)))
}

fn std_itoa(_: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    let value = integer(args, 0)?;
    let base = if args.len() > 1 { integer(args, 1)? } else { 10 };
    if !(2..=36).contains(&base) {
        return Err(format!("base must be between 2 and 36, got {base}"));
    }
    let base = base as u64;
    let mut digits = Vec::new();
    let mut rest = value.unsigned_abs();
    loop {
        let digit = (rest % base) as u32;
        digits.push(std::char::from_digit(digit, base as u32).unwrap_or('0'));
        rest /= base;
        if rest == 0 {
            break;
        }
    }
    if value < 0 {
        digits.push('-');
    }
    Ok(Value::string(digits.into_iter().rev().collect::<String>()))
}

fn std_prefixof(_: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    Ok(Value::bool(text(args, 0).starts_with(&text(args, 1))))
}

fn std_suffixof(_: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    Ok(Value::bool(text(args, 0).ends_with(&text(args, 1))))
}

fn std_strstr(_: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    let haystack = text(args, 0);
    let found = haystack
        .find(&text(args, 1))
        .map(|idx| haystack[idx..].to_string())
        .unwrap_or_default();
    Ok(Value::string(found))
}

fn std_replaceall(_: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    let needle = text(args, 1);
    if needle.is_empty() {
        return Ok(Value::string(text(args, 0)));
    }
    Ok(Value::string(text(args, 0).replace(&needle, &text(args, 2))))
}

/// Folds every line of a header into one, e.g. `std.collect(req.http.Cookie)`.
fn std_collect(interp: &Interpreter, ctx: &mut Context, args: &[Value]) -> Result<Value, String> {
    let target = ident(args, 0)?;
    let (object, name) = target
        .split_once(".http.")
        .ok_or_else(|| format!("{target} is not a header"))?;
    interp.header_object(ctx, object, true)?.collect(name);
    Ok(Value::null())
}

/// Rewrites `\N` back-references to the `${N}` form and escapes `$`.
fn replacement(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' if chars.peek().is_some_and(char::is_ascii_digit) => {
                out.push_str("${");
                while let Some(digit) = chars.peek().copied().filter(char::is_ascii_digit) {
                    out.push(digit);
                    chars.next();
                }
                out.push('}');
            }
            '$' => out.push_str("$$"),
            other => out.push(other),
        }
    }
    out
}

fn compile(pattern: &str) -> Result<Regex, String> {
    Regex::new(pattern)
        .map_err(|_| format!("Failed to compile regular expression from string {pattern}"))
}

fn regsub(_: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    let re = compile(&text(args, 1))?;
    let subject = text(args, 0);
    let out = re.replacen(&subject, 1, replacement(&text(args, 2)).as_str());
    Ok(Value::string(out.into_owned()))
}

fn regsuball(_: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    let re = compile(&text(args, 1))?;
    let subject = text(args, 0);
    let out = re.replace_all(&subject, replacement(&text(args, 2)).as_str());
    Ok(Value::string(out.into_owned()))
}

/// Character-based substring. A negative offset counts from the end; a
/// negative length leaves that many characters off the end.
fn substr(_: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    let chars: Vec<char> = text(args, 0).chars().collect();
    let len = chars.len() as i64;
    let offset = integer(args, 1)?;
    let start = if offset < 0 { len + offset } else { offset };
    if start < 0 || start > len {
        return Ok(Value::not_set());
    }
    let end = match args.get(2) {
        Some(_) => {
            let length = integer(args, 2)?;
            if length < 0 { len + length } else { start + length }
        }
        None => len,
    }
    .clamp(start, len);
    Ok(Value::string(
        chars[start as usize..end as usize].iter().collect::<String>(),
    ))
}

fn urlencode(_: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    let mut out = String::new();
    for byte in text(args, 0).bytes() {
        if byte.is_ascii_alphanumeric() || b"-_.~".contains(&byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    Ok(Value::string(out))
}

fn urldecode(_: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    let raw = text(args, 0);
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'%' && idx + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[idx + 1..idx + 3]).unwrap_or("");
            if let Ok(byte) = u8::from_str_radix(hex, 16) {
                out.push(byte);
                idx += 3;
                continue;
            }
        }
        out.push(bytes[idx]);
        idx += 1;
    }
    Ok(Value::string(String::from_utf8_lossy(&out).into_owned()))
}

fn table_lookup(interp: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    let name = ident(args, 0)?;
    let table = interp
        .table(name)
        .ok_or_else(|| format!("Table {name} is not defined"))?;
    let key = text(args, 1);
    let mut value = match table.entries.get(&key) {
        Some(value) => value.clone(),
        None => match args.get(2) {
            Some(default) => default.clone(),
            None => Value::not_set(),
        },
    };
    value.literal = false;
    Ok(value)
}

fn table_contains(interp: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    let name = ident(args, 0)?;
    let table = interp
        .table(name)
        .ok_or_else(|| format!("Table {name} is not defined"))?;
    Ok(Value::bool(table.entries.contains_key(&text(args, 1))))
}

fn ratecounter_increment(
    interp: &Interpreter,
    ctx: &mut Context,
    args: &[Value],
) -> Result<Value, String> {
    let name = ident(args, 0)?;
    let counter = interp
        .decls
        .ratecounters
        .get(name)
        .ok_or_else(|| format!("Ratecounter {name} is not defined"))?;
    let entry = text(args, 1);
    counter.increment(&entry, integer(args, 2)?);
    ctx.ratecounter_entries.insert(name.to_string(), entry);
    Ok(Value::int(0))
}

/// `ratelimit.check_rate(entry, rc, delta, window, limit, pb, ttl)`.
fn check_rate(interp: &Interpreter, ctx: &mut Context, args: &[Value]) -> Result<Value, String> {
    let entry = text(args, 0);
    let rc_name = ident(args, 1)?;
    let pb_name = ident(args, 5)?;
    let counter = interp
        .decls
        .ratecounters
        .get(rc_name)
        .ok_or_else(|| format!("Ratecounter {rc_name} is not defined"))?;
    let penaltybox = interp
        .decls
        .penaltyboxes
        .get(pb_name)
        .ok_or_else(|| format!("Penaltybox {pb_name} is not defined"))?;
    let delta = integer(args, 2)?;
    let window = integer(args, 3)?;
    let limit = integer(args, 4)?;
    let ttl = rtime(args, 6)?;

    ctx.ratecounter_entries
        .insert(rc_name.to_string(), entry.clone());
    if penaltybox.has(&entry) {
        return Ok(Value::bool(true));
    }
    counter.increment(&entry, delta);
    let rate = counter.rate(&entry, StdDuration::from_secs(u64::try_from(window).unwrap_or(1)));
    if rate > limit as f64 {
        penaltybox.add(&entry, std_duration(ttl));
        return Ok(Value::bool(true));
    }
    Ok(Value::bool(false))
}

fn penaltybox_add(interp: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    let name = ident(args, 0)?;
    let penaltybox = interp
        .decls
        .penaltyboxes
        .get(name)
        .ok_or_else(|| format!("Penaltybox {name} is not defined"))?;
    penaltybox.add(&text(args, 1), std_duration(rtime(args, 2)?));
    Ok(Value::null())
}

fn penaltybox_has(interp: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    let name = ident(args, 0)?;
    let penaltybox = interp
        .decls
        .penaltyboxes
        .get(name)
        .ok_or_else(|| format!("Penaltybox {name} is not defined"))?;
    Ok(Value::bool(penaltybox.has(&text(args, 1))))
}

fn hash_sha256(_: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    let digest = Sha256::digest(text(args, 0).as_bytes());
    Ok(Value::string(bytes::encode_hex(&digest)))
}

fn hmac_sha256(_: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(text(args, 0).as_bytes())
        .map_err(|err| err.to_string())?;
    mac.update(text(args, 1).as_bytes());
    Ok(Value::string(bytes::encode_hex(&mac.finalize().into_bytes())))
}

fn base64(_: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    Ok(Value::string(bytes::encode_base64(text(args, 0).as_bytes())))
}

fn base64url(_: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    Ok(Value::string(bytes::encode_base64_with(
        text(args, 0).as_bytes(),
        Alphabet::UrlSafe,
    )))
}

fn base64_decode(_: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    let decoded = bytes::decode_base64(&text(args, 0))?;
    Ok(Value::string(
        String::from_utf8_lossy(&decoded).into_owned(),
    ))
}

const RANDOM_CHARSET: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789+/";

fn randomstr(_: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    let length = usize::try_from(integer(args, 0)?).map_err(|_| "length must not be negative")?;
    let charset: Vec<char> = if args.len() > 1 {
        text(args, 1).chars().collect()
    } else {
        RANDOM_CHARSET.chars().collect()
    };
    if charset.is_empty() {
        return Err("charset must not be empty".to_string());
    }
    let mut buf = vec![0u8; length];
    getrandom::fill(&mut buf).map_err(|err| err.to_string())?;
    let out: String = buf
        .iter()
        .map(|byte| charset[usize::from(*byte) % charset.len()])
        .collect();
    Ok(Value::string(out))
}

fn shifted(args: &[Value], sign: i64) -> Result<Value, String> {
    let ValueKind::Time { at, .. } = args.first().map(|v| &v.kind).ok_or("missing time")? else {
        return Err("argument 1 must be TIME".to_string());
    };
    let delta = rtime(args, 1)?;
    Ok(match delta.checked_mul(sign) {
        Some(delta) => Value::time_shifted(*at, delta),
        None => Value::time_shifted(*at, i64::MAX),
    })
}

fn time_add(_: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    shifted(args, 1)
}

fn time_sub(_: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    shifted(args, -1)
}

fn header_get(interp: &Interpreter, ctx: &mut Context, args: &[Value]) -> Result<Value, String> {
    let object = ident(args, 0)?;
    let ls = interp.header_object(ctx, object, false)?.get(&text(args, 1));
    Ok(ls.to_value())
}

fn header_set(interp: &Interpreter, ctx: &mut Context, args: &[Value]) -> Result<Value, String> {
    let object = ident(args, 0)?;
    let name = text(args, 1);
    if crate::header::is_reserved(&name) {
        return Err(format!("Header {name} is reserved and could not be modified"));
    }
    let value = Value::string(text(args, 2));
    interp.header_object(ctx, object, true)?.set(&name, value);
    Ok(Value::null())
}

fn header_unset(interp: &Interpreter, ctx: &mut Context, args: &[Value]) -> Result<Value, String> {
    let object = ident(args, 0)?;
    let name = text(args, 1);
    if crate::header::is_reserved(&name) {
        return Err(format!("Header {name} is reserved and could not be modified"));
    }
    interp.header_object(ctx, object, true)?.del(&name);
    Ok(Value::null())
}

fn h2_push(_: &Interpreter, _: &mut Context, _: &[Value]) -> Result<Value, String> {
    Ok(Value::null())
}

fn mark(interp: &Interpreter, kind: CoverageKind, args: &[Value]) -> Result<Value, String> {
    if let Some(coverage) = &interp.coverage {
        coverage.mark(kind, &text(args, 0));
    }
    Ok(Value::null())
}

fn coverage_subroutine(interp: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    mark(interp, CoverageKind::Subroutine, args)
}

fn coverage_statement(interp: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    mark(interp, CoverageKind::Statement, args)
}

fn coverage_branch(interp: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    mark(interp, CoverageKind::Branch, args)
}

fn math_is_finite(_: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    let finite = match args.first().map(|value| &value.kind) {
        Some(ValueKind::Float { value, .. }) => value.is_finite(),
        Some(ValueKind::Integer { .. }) => true,
        _ => return Err("argument 1 must be FLOAT".to_string()),
    };
    Ok(Value::bool(finite))
}

fn std_str2float(_: &Interpreter, _: &mut Context, args: &[Value]) -> Result<Value, String> {
    Ok(Value::float(text(args, 0).trim().parse().unwrap_or(0.0)))
}
