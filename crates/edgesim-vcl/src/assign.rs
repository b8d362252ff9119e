//! `set` semantics: plain assignment and the compound operators, with the
//! implicit conversions and literal restrictions of each target type.

use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

use crate::token::AssignOp;
use crate::value::{NumState, Value, ValueKind, ValueType};

type AssignResult = Result<(), String>;

/// Applies `left <op> right` in place.
pub fn apply(op: AssignOp, left: &mut Value, right: &Value) -> AssignResult {
    match op {
        AssignOp::Assign => assign(left, right),
        AssignOp::Add => arithmetic(Arith::Add, left, right),
        AssignOp::Sub => arithmetic(Arith::Sub, left, right),
        AssignOp::Mul => arithmetic(Arith::Mul, left, right),
        AssignOp::Div => arithmetic(Arith::Div, left, right),
        AssignOp::Rem => arithmetic(Arith::Rem, left, right),
        AssignOp::BitOr
        | AssignOp::BitAnd
        | AssignOp::BitXor
        | AssignOp::Shl
        | AssignOp::Shr
        | AssignOp::Rol
        | AssignOp::Ror => bitwise(op, left, right),
        AssignOp::LogicalOr | AssignOp::LogicalAnd => logical(op, left, right),
    }
}

/// `set req.hash += value;`: folds the value into the running SHA-256 hex digest.
pub fn update_hash(current: &str, right: &Value) -> Result<String, String> {
    let ty = right.ty();
    if right.literal && ty != ValueType::String && ty != ValueType::Bool {
        return Err(format!("Only STRING and BOOL literals are allowed, got {ty}"));
    }
    if ty == ValueType::Ident {
        return Err(format!("Unsupported type {ty}"));
    }
    let mut hasher = Sha256::new();
    hasher.update(current.as_bytes());
    hasher.update(right.render().as_bytes());
    Ok(edgesim_rt::bytes::encode_hex(&hasher.finalize()))
}

fn literal_guard(right: &Value, left: ValueType, verb: &str) -> AssignResult {
    if right.literal {
        return Err(format!(
            "{} literal could not {verb} to {left}",
            right.ty()
        ));
    }
    Ok(())
}

fn unix(at: &DateTime<Utc>) -> i64 {
    at.timestamp()
}

fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
}

pub fn assign(left: &mut Value, right: &Value) -> AssignResult {
    let left_ty = left.ty();
    let invalid = || format!("invalid assignment for {left_ty} type, got {}", right.ty());
    let next = match (left_ty, &right.kind) {
        (ValueType::Integer, ValueKind::Integer { value, state }) => ValueKind::Integer {
            value: *value,
            state: *state,
        },
        (ValueType::Integer, ValueKind::Float { value, state }) => {
            literal_guard(right, left_ty, "assign")?;
            ValueKind::Integer {
                value: *value as i64,
                state: *state,
            }
        }
        (ValueType::Integer, ValueKind::RTime(ms)) => {
            literal_guard(right, left_ty, "assign")?;
            ValueKind::Integer {
                value: ms / 1000,
                state: NumState::Finite,
            }
        }
        (ValueType::Integer, ValueKind::Time { at, out_of_bounds }) => ValueKind::Integer {
            value: if *out_of_bounds { 0 } else { unix(at) },
            state: NumState::Finite,
        },
        (ValueType::Float, ValueKind::Integer { value, state }) => ValueKind::Float {
            value: *value as f64,
            state: *state,
        },
        (ValueType::Float, ValueKind::Float { value, state }) => ValueKind::Float {
            value: *value,
            state: *state,
        },
        (ValueType::Float, ValueKind::RTime(ms)) => {
            literal_guard(right, left_ty, "assign")?;
            ValueKind::Float {
                value: *ms as f64 / 1000.0,
                state: NumState::Finite,
            }
        }
        (ValueType::Float, ValueKind::Time { at, out_of_bounds }) => ValueKind::Float {
            value: if *out_of_bounds { 0.0 } else { unix(at) as f64 },
            state: NumState::Finite,
        },
        (ValueType::String, ValueKind::String { value, not_set }) => ValueKind::String {
            value: value.clone(),
            not_set: *not_set,
        },
        (ValueType::String, ValueKind::Lenient(ls)) => ValueKind::String {
            value: ls.strict(),
            not_set: ls.not_set,
        },
        (ValueType::String, ValueKind::Bool(_)) => ValueKind::String {
            value: right.render(),
            not_set: false,
        },
        (ValueType::String, ValueKind::Ip(addr)) => ValueKind::String {
            value: right.render(),
            not_set: addr.is_none(),
        },
        (
            ValueType::String,
            ValueKind::Integer { .. }
            | ValueKind::Float { .. }
            | ValueKind::RTime(_)
            | ValueKind::Backend(_),
        ) => {
            literal_guard(right, left_ty, "assign")?;
            ValueKind::String {
                value: right.render(),
                not_set: false,
            }
        }
        (ValueType::String, ValueKind::Time { .. }) => ValueKind::String {
            value: right.render(),
            not_set: false,
        },
        (ValueType::RTime, ValueKind::Integer { value, .. }) => {
            literal_guard(right, left_ty, "assign")?;
            ValueKind::RTime(value.saturating_mul(1000))
        }
        (ValueType::RTime, ValueKind::Float { value, .. }) => {
            literal_guard(right, left_ty, "assign")?;
            ValueKind::RTime((value * 1000.0) as i64)
        }
        (ValueType::RTime, ValueKind::RTime(ms)) => ValueKind::RTime(*ms),
        (ValueType::RTime, ValueKind::Time { at, .. }) => {
            ValueKind::RTime(unix(at).saturating_mul(1000))
        }
        (ValueType::Time, ValueKind::Integer { value, .. }) => {
            literal_guard(right, left_ty, "assign")?;
            time_kind(from_unix(*value))
        }
        (ValueType::Time, ValueKind::Float { value, .. }) => {
            literal_guard(right, left_ty, "assign")?;
            time_kind(from_unix(*value as i64))
        }
        (ValueType::Time, ValueKind::RTime(ms)) => time_kind(from_unix(ms / 1000)),
        (ValueType::Time, ValueKind::Time { at, out_of_bounds }) => ValueKind::Time {
            at: *at,
            out_of_bounds: *out_of_bounds,
        },
        (ValueType::Backend, ValueKind::Backend(backend)) => ValueKind::Backend(backend.clone()),
        (ValueType::Bool, ValueKind::Bool(v)) => ValueKind::Bool(*v),
        (ValueType::Ip, ValueKind::Ip(addr)) => ValueKind::Ip(*addr),
        (ValueType::Ip, ValueKind::String { .. } | ValueKind::Lenient(_)) => {
            let raw = right.render();
            let addr: IpAddr = raw
                .parse()
                .map_err(|_| format!("invalid IP format, got {raw}"))?;
            ValueKind::Ip(Some(addr))
        }
        (ValueType::Null | ValueType::Ident | ValueType::Acl, _) => {
            return Err(format!("could not use assignment for type {left_ty}"));
        }
        _ => return Err(invalid()),
    };
    left.kind = next;
    Ok(())
}

fn time_kind(at: Option<DateTime<Utc>>) -> ValueKind {
    match at {
        Some(at) => ValueKind::Time {
            at,
            out_of_bounds: false,
        },
        None => ValueKind::Time {
            at: DateTime::<Utc>::UNIX_EPOCH,
            out_of_bounds: true,
        },
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Arith {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl Arith {
    fn verb(self) -> &'static str {
        match self {
            Arith::Add => "add",
            Arith::Sub => "sub",
            Arith::Mul => "multiple",
            Arith::Div => "divide",
            Arith::Rem => "remainder",
        }
    }

    fn name(self) -> &'static str {
        match self {
            Arith::Add => "addition",
            Arith::Sub => "subtraction",
            Arith::Mul => "multiplication",
            Arith::Div => "division",
            Arith::Rem => "remainder",
        }
    }

    fn additive(self) -> bool {
        matches!(self, Arith::Add | Arith::Sub)
    }
}

/// Right operand reduced to a number, after the literal checks for the
/// target type have passed.
enum Operand {
    Int(i64, NumState),
    Float(f64, NumState),
    /// Milliseconds.
    RTime(i64),
    /// Unix seconds.
    Time(i64),
}

fn operand(op: Arith, left_ty: ValueType, right: &Value) -> Result<Operand, String> {
    let invalid = || {
        format!(
            "Invalid {} {left_ty} type, got {}",
            op.name(),
            right.ty()
        )
    };
    let guard = || literal_guard(right, left_ty, op.verb());
    let allowed = match (left_ty, &right.kind) {
        (ValueType::Integer, ValueKind::Integer { .. }) => true,
        (ValueType::Integer, ValueKind::Float { .. }) => {
            guard()?;
            true
        }
        (ValueType::Integer, ValueKind::RTime(_) | ValueKind::Time { .. }) if op.additive() => {
            guard()?;
            true
        }
        (ValueType::Float, ValueKind::Integer { .. } | ValueKind::Float { .. }) => true,
        (ValueType::Float, ValueKind::RTime(_) | ValueKind::Time { .. }) if op.additive() => {
            guard()?;
            true
        }
        (ValueType::RTime, ValueKind::Integer { .. } | ValueKind::Float { .. }) => {
            if op.additive() {
                guard()?;
            }
            true
        }
        (ValueType::RTime, ValueKind::RTime(_)) if op.additive() => true,
        (ValueType::RTime, ValueKind::Time { .. }) if op.additive() => {
            guard()?;
            true
        }
        (ValueType::Time, ValueKind::Integer { .. } | ValueKind::Float { .. })
            if op.additive() =>
        {
            guard()?;
            true
        }
        (ValueType::Time, ValueKind::RTime(_)) if op.additive() => true,
        _ => false,
    };
    if !allowed {
        return Err(invalid());
    }
    Ok(match &right.kind {
        ValueKind::Integer { value, state } => Operand::Int(*value, *state),
        ValueKind::Float { value, state } => Operand::Float(*value, *state),
        ValueKind::RTime(ms) => Operand::RTime(*ms),
        ValueKind::Time { at, .. } => Operand::Time(unix(at)),
        _ => return Err(invalid()),
    })
}

fn arithmetic(op: Arith, left: &mut Value, right: &Value) -> AssignResult {
    let left_ty = left.ty();
    if !matches!(
        left_ty,
        ValueType::Integer | ValueType::Float | ValueType::RTime | ValueType::Time
    ) {
        return Err(format!(
            "Could not use {} assignment for type {left_ty}",
            op.name()
        ));
    }
    let rhs = operand(op, left_ty, right)?;
    match &mut left.kind {
        ValueKind::Integer { value, state } => integer_op(op, value, state, rhs),
        ValueKind::Float { value, state } => float_op(op, value, state, rhs),
        ValueKind::RTime(ms) => rtime_op(op, ms, rhs),
        ValueKind::Time { at, out_of_bounds } => time_op(op, at, out_of_bounds, rhs),
        _ => Err(format!("Could not use {} assignment for type {left_ty}", op.name())),
    }
}

fn integer_op(op: Arith, value: &mut i64, state: &mut NumState, rhs: Operand) -> AssignResult {
    let (rv, rstate) = match rhs {
        Operand::Int(v, s) => (v as f64, s),
        Operand::Float(v, s) => (v, s),
        Operand::RTime(ms) => ((ms / 1000) as f64, NumState::Finite),
        Operand::Time(secs) => (secs as f64, NumState::Finite),
    };
    if matches!(op, Arith::Div | Arith::Rem) && rv as i64 == 0 && rstate == NumState::Finite {
        *state = NumState::Nan;
        return Err("Division by zero".to_string());
    }
    match rstate {
        NumState::PosInf if op != Arith::Rem => {
            let flip = op == Arith::Sub;
            set_int_inf(value, state, !flip);
            return Ok(());
        }
        NumState::NegInf if op != Arith::Rem => {
            let flip = op == Arith::Sub;
            set_int_inf(value, state, flip);
            return Ok(());
        }
        NumState::Nan => {
            *value = 0;
            *state = NumState::Nan;
            return Ok(());
        }
        _ => {}
    }
    let lv = *value;
    let ri = rv as i64;
    let exact = match op {
        Arith::Add => lv.checked_add(ri),
        Arith::Sub => lv.checked_sub(ri),
        Arith::Mul => match rhs_is_float(rv) {
            true => Some((lv as f64 * rv) as i64),
            false => lv.checked_mul(ri),
        },
        Arith::Div => lv.checked_div(ri),
        Arith::Rem => lv.checked_rem(ri),
    };
    match exact {
        Some(result) => *value = result,
        None => {
            let wide = match op {
                Arith::Add => lv as f64 + rv,
                Arith::Sub => lv as f64 - rv,
                _ => lv as f64 * rv,
            };
            set_int_inf(value, state, wide >= 0.0);
        }
    }
    Ok(())
}

fn rhs_is_float(rv: f64) -> bool {
    rv.fract() != 0.0
}

fn set_int_inf(value: &mut i64, state: &mut NumState, positive: bool) {
    if positive {
        *value = i64::MAX;
        *state = NumState::PosInf;
    } else {
        *value = i64::MIN;
        *state = NumState::NegInf;
    }
}

fn float_op(op: Arith, value: &mut f64, state: &mut NumState, rhs: Operand) -> AssignResult {
    let (rv, rstate) = match rhs {
        Operand::Int(v, s) => (v as f64, s),
        Operand::Float(v, s) => (v, s),
        Operand::RTime(ms) => (ms as f64 / 1000.0, NumState::Finite),
        Operand::Time(secs) => (secs as f64, NumState::Finite),
    };
    if matches!(op, Arith::Div | Arith::Rem) && rv == 0.0 {
        *state = NumState::Nan;
        return Err("Division by zero".to_string());
    }
    let result = match op {
        Arith::Add => *value + rv,
        Arith::Sub => *value - rv,
        Arith::Mul => *value * rv,
        Arith::Div => *value / rv,
        Arith::Rem => ((*value as i64) % (rv as i64).max(1)) as f64,
    };
    let result = match rstate {
        NumState::PosInf if op == Arith::Sub => f64::NEG_INFINITY,
        NumState::PosInf => f64::INFINITY,
        NumState::NegInf if op == Arith::Sub => f64::INFINITY,
        NumState::NegInf => f64::NEG_INFINITY,
        NumState::Nan => f64::NAN,
        NumState::Finite => result,
    };
    if result.is_nan() {
        *value = 0.0;
        *state = NumState::Nan;
    } else if result == f64::INFINITY {
        *value = f64::MAX;
        *state = NumState::PosInf;
    } else if result == f64::NEG_INFINITY {
        *value = -f64::MAX;
        *state = NumState::NegInf;
    } else {
        *value = result;
    }
    Ok(())
}

fn rtime_op(op: Arith, ms: &mut i64, rhs: Operand) -> AssignResult {
    let lv = *ms;
    let next = match (op, rhs) {
        (Arith::Add, Operand::Int(v, _)) => lv.checked_add(v.saturating_mul(1000)),
        (Arith::Sub, Operand::Int(v, _)) => lv.checked_sub(v.saturating_mul(1000)),
        (Arith::Add, Operand::Float(v, _)) => lv.checked_add((v * 1000.0) as i64),
        (Arith::Sub, Operand::Float(v, _)) => lv.checked_sub((v * 1000.0) as i64),
        (Arith::Add, Operand::RTime(v)) => lv.checked_add(v),
        (Arith::Sub, Operand::RTime(v)) => lv.checked_sub(v),
        (Arith::Add, Operand::Time(secs)) => lv.checked_add(secs.saturating_mul(1000)),
        (Arith::Sub, Operand::Time(secs)) => lv.checked_sub(secs.saturating_mul(1000)),
        (Arith::Mul, Operand::Int(v, _)) => lv.checked_mul(v),
        (Arith::Mul, Operand::Float(v, _)) => Some((lv as f64 * v) as i64),
        (Arith::Div, Operand::Int(v, _)) => {
            if v == 0 {
                return Err("Division by zero".to_string());
            }
            lv.checked_div(v)
        }
        (Arith::Div, Operand::Float(v, _)) => {
            if v == 0.0 {
                return Err("Division by zero".to_string());
            }
            Some((lv as f64 / v) as i64)
        }
        (Arith::Rem, Operand::Int(v, _)) => lv.checked_rem(v.saturating_mul(1000)),
        (Arith::Rem, Operand::Float(v, _)) => lv.checked_rem((v * 1000.0) as i64),
        _ => return Err(format!("Invalid {} RTIME type", op.name())),
    };
    *ms = next.ok_or_else(|| format!("RTIME {} overflowed", op.name()))?;
    Ok(())
}

fn time_op(
    op: Arith,
    at: &mut DateTime<Utc>,
    out_of_bounds: &mut bool,
    rhs: Operand,
) -> AssignResult {
    let delta_ms = match rhs {
        Operand::Int(v, _) => v.saturating_mul(1000),
        Operand::Float(v, _) => (v * 1000.0) as i64,
        Operand::RTime(ms) => ms,
        Operand::Time(_) => return Err(format!("Invalid {} TIME type, got TIME", op.name())),
    };
    let delta = Duration::try_milliseconds(delta_ms);
    let next = match (op, delta) {
        (Arith::Add, Some(delta)) => at.checked_add_signed(delta),
        (Arith::Sub, Some(delta)) => at.checked_sub_signed(delta),
        _ => None,
    };
    match next {
        Some(next) => *at = next,
        None => *out_of_bounds = true,
    }
    Ok(())
}

fn bitwise(op: AssignOp, left: &mut Value, right: &Value) -> AssignResult {
    let (ValueKind::Integer { value, state }, ValueKind::Integer { value: rv, state: rs }) =
        (&mut left.kind, &right.kind)
    else {
        return Err(format!(
            "Invalid {} operation, both sides must be INTEGER, got {} and {}",
            op.as_str(),
            left.ty(),
            right.ty()
        ));
    };
    if *state != NumState::Finite || *rs != NumState::Finite {
        *value = 0;
        *state = NumState::Finite;
        return Ok(());
    }
    let shift = u32::try_from(*rv).unwrap_or(u32::MAX);
    *value = match op {
        AssignOp::BitOr => *value | rv,
        AssignOp::BitAnd => *value & rv,
        AssignOp::BitXor => *value ^ rv,
        AssignOp::Shl => value.checked_shl(shift).unwrap_or(0),
        AssignOp::Shr => value.checked_shr(shift).unwrap_or(0),
        AssignOp::Rol => (*value as u64).rotate_left((*rv & 63) as u32) as i64,
        AssignOp::Ror => (*value as u64).rotate_right((*rv & 63) as u32) as i64,
        _ => return Err(format!("unexpected bitwise operator {}", op.as_str())),
    };
    Ok(())
}

fn logical(op: AssignOp, left: &mut Value, right: &Value) -> AssignResult {
    let (ValueKind::Bool(lv), ValueKind::Bool(rv)) = (&mut left.kind, &right.kind) else {
        return Err(format!(
            "Invalid {} operation, both sides must be BOOL, got {} and {}",
            op.as_str(),
            left.ty(),
            right.ty()
        ));
    };
    *lv = match op {
        AssignOp::LogicalOr => *lv || *rv,
        _ => *lv && *rv,
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{apply, update_hash};
    use crate::token::AssignOp;
    use crate::value::{NumState, Value, ValueKind};

    #[test]
    fn integer_rejects_float_literals_but_truncates_derived_floats() {
        let mut left = Value::int(1);
        let err = apply(AssignOp::Assign, &mut left, &Value::float(2.5).into_literal());
        assert_eq!(err.unwrap_err(), "FLOAT literal could not assign to INTEGER");
        apply(AssignOp::Assign, &mut left, &Value::float(-2.9)).expect("assign");
        assert_eq!(left.as_int(), Some(-2));
    }

    #[test]
    fn string_formats_derived_values() {
        let mut left = Value::not_set();
        apply(AssignOp::Assign, &mut left, &Value::rtime(1500)).expect("assign");
        assert_eq!(left.render(), "1.500");
        apply(AssignOp::Assign, &mut left, &Value::bool(true).into_literal()).expect("assign");
        assert_eq!(left.render(), "1");
        assert!(apply(AssignOp::Assign, &mut left, &Value::int(1).into_literal()).is_err());
    }

    #[test]
    fn integer_addition_saturates_to_inf() {
        let mut left = Value::int(i64::MAX - 1);
        apply(AssignOp::Add, &mut left, &Value::int(5)).expect("add");
        assert!(matches!(
            left.kind,
            ValueKind::Integer {
                state: NumState::PosInf,
                ..
            }
        ));
        assert_eq!(left.render(), "inf");
    }

    #[test]
    fn division_by_zero_marks_nan() {
        let mut left = Value::int(10);
        assert_eq!(
            apply(AssignOp::Div, &mut left, &Value::int(0)).unwrap_err(),
            "Division by zero"
        );
        assert_eq!(left.render(), "NAN");
    }

    #[test]
    fn time_moves_by_rtime() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().expect("time");
        let mut left = Value::time(start);
        apply(AssignOp::Add, &mut left, &Value::rtime(300_000).into_literal()).expect("add");
        assert_eq!(left.render(), "Wed, 01 Jan 2025 00:05:00 GMT");
    }

    #[test]
    fn bit_operations_need_integers() {
        let mut left = Value::int(1);
        apply(AssignOp::Shl, &mut left, &Value::int(4)).expect("shl");
        assert_eq!(left.as_int(), Some(16));
        apply(AssignOp::Ror, &mut left, &Value::int(4)).expect("ror");
        assert_eq!(left.as_int(), Some(1));
        apply(AssignOp::Ror, &mut left, &Value::int(1)).expect("ror");
        assert_eq!(left.as_int(), Some(i64::MIN));
        assert!(apply(AssignOp::BitOr, &mut left, &Value::string("1")).is_err());
    }

    #[test]
    fn logical_operators_need_bools() {
        let mut left = Value::bool(false);
        apply(AssignOp::LogicalOr, &mut left, &Value::bool(true)).expect("or");
        assert_eq!(left.as_bool(), Some(true));
        apply(AssignOp::LogicalAnd, &mut left, &Value::bool(false)).expect("and");
        assert_eq!(left.as_bool(), Some(false));
        assert!(apply(AssignOp::LogicalOr, &mut left, &Value::int(1)).is_err());
    }

    #[test]
    fn ip_accepts_parsable_strings() {
        let mut left = Value::new(ValueKind::Ip(None));
        apply(AssignOp::Assign, &mut left, &Value::string("192.0.2.1")).expect("ip");
        assert_eq!(left.render(), "192.0.2.1");
        assert!(apply(AssignOp::Assign, &mut left, &Value::string("nope")).is_err());
    }

    #[test]
    fn hash_update_chains_sha256() {
        let digest = update_hash("", &Value::string("/index.html")).expect("hash");
        assert_eq!(digest.len(), 64);
        assert!(update_hash("", &Value::int(1).into_literal()).is_err());
    }
}
