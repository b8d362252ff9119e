//! Infix operators of VCL expressions.

use regex::Regex;

use crate::ast::BinaryOp;
use crate::value::{Value, ValueKind, ValueType};

pub type OpResult = Result<Value, String>;

fn invalid_comparison(left: &Value, right: &Value) -> String {
    format!("Invalid type comparison {} and {}", left.ty(), right.ty())
}

pub fn equal(left: &Value, right: &Value) -> OpResult {
    if left.ty() != right.ty() {
        return Err(invalid_comparison(left, right));
    }
    if left.literal {
        return Err("Could not use literal for equal operator".to_string());
    }
    Ok(Value::bool(left.render() == right.render()))
}

pub fn not_equal(left: &Value, right: &Value) -> OpResult {
    let eq = equal(left, right)?;
    Ok(Value::bool(eq.as_bool() != Some(true)))
}

/// Numeric projection used by the ordering operators. RTIME compares in
/// whole seconds against numbers and in milliseconds against RTIME.
fn ordering_operands(left: &Value, right: &Value) -> Result<(f64, f64), String> {
    if left.literal {
        return Err(format!("Left {} type could not be a literal", left.ty()));
    }
    let right_literal = |ty: ValueType| -> Result<(), String> {
        if right.literal {
            Err(format!("Right {ty} type could not be a literal"))
        } else {
            Ok(())
        }
    };
    let pair = match (&left.kind, &right.kind) {
        (ValueKind::Integer { value: l, .. }, ValueKind::Integer { value: r, .. }) => {
            (*l as f64, *r as f64)
        }
        (ValueKind::Integer { value: l, .. }, ValueKind::RTime(ms)) => {
            right_literal(ValueType::RTime)?;
            (*l as f64, (ms / 1000) as f64)
        }
        (ValueKind::Float { value: l, .. }, ValueKind::Integer { value: r, .. }) => {
            (*l, *r as f64)
        }
        (ValueKind::Float { value: l, .. }, ValueKind::Float { value: r, .. }) => (*l, *r),
        (ValueKind::Float { value: l, .. }, ValueKind::RTime(ms)) => {
            right_literal(ValueType::RTime)?;
            (*l, (ms / 1000) as f64)
        }
        (ValueKind::RTime(ms), ValueKind::Integer { value: r, .. }) => {
            right_literal(ValueType::Integer)?;
            ((ms / 1000) as f64, *r as f64)
        }
        (ValueKind::RTime(ms), ValueKind::Float { value: r, .. }) => {
            right_literal(ValueType::Float)?;
            ((ms / 1000) as f64, *r)
        }
        (ValueKind::RTime(l), ValueKind::RTime(r)) => (*l as f64, *r as f64),
        (ValueKind::Time { at: l, .. }, ValueKind::Time { at: r, .. }) => {
            (l.timestamp_millis() as f64, r.timestamp_millis() as f64)
        }
        _ => return Err(invalid_comparison(left, right)),
    };
    Ok(pair)
}

/// `>`, `<`, `>=` and `<=`.
pub fn compare(op: BinaryOp, left: &Value, right: &Value) -> OpResult {
    let (l, r) = ordering_operands(left, right)?;
    let result = match op {
        BinaryOp::Gt => l > r,
        BinaryOp::Lt => l < r,
        BinaryOp::GtEq => l >= r,
        BinaryOp::LtEq => l <= r,
        other => return Err(format!("{} is not an ordering operator", other.as_str())),
    };
    Ok(Value::bool(result))
}

/// `~`: regex match on strings, membership on ACLs. Capture groups of a
/// successful regex match are written to `captures`, group 0 first.
pub fn regex_match(left: &Value, right: &Value, captures: &mut Vec<String>) -> OpResult {
    match (&left.kind, &right.kind) {
        (ValueKind::String { .. } | ValueKind::Lenient(_), ValueKind::String { value, .. }) => {
            if left.literal {
                return Err("Left STRING type could not be a literal".to_string());
            }
            let re = Regex::new(value).map_err(|_| {
                format!("Failed to compile regular expression from string {value}")
            })?;
            let subject = left.render();
            match re.captures(&subject) {
                Some(caps) => {
                    captures.clear();
                    captures.extend(
                        caps.iter()
                            .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default()),
                    );
                    Ok(Value::bool(true))
                }
                None => Ok(Value::bool(false)),
            }
        }
        (ValueKind::Ip(addr), ValueKind::Acl(acl)) => {
            Ok(Value::bool(addr.is_some_and(|ip| acl.matches(ip))))
        }
        _ => Err(invalid_comparison(left, right)),
    }
}

pub fn regex_not_match(left: &Value, right: &Value, captures: &mut Vec<String>) -> OpResult {
    let matched = regex_match(left, right, captures)?;
    Ok(Value::bool(matched.as_bool() != Some(true)))
}

fn logical(name: &str, left: &Value, right: &Value) -> Result<(bool, bool), String> {
    match (&left.kind, &right.kind) {
        (ValueKind::Bool(l), ValueKind::Bool(r)) => Ok((*l, *r)),
        (ValueKind::Bool(_), _) => Err(format!(
            "Logical {name} operator: right type must be BOOL, got {}",
            right.ty()
        )),
        _ => Err(format!(
            "Logical {name} operator: left type must be BOOL, got {}",
            left.ty()
        )),
    }
}

pub fn logical_and(left: &Value, right: &Value) -> OpResult {
    let (l, r) = logical("AND", left, right)?;
    Ok(Value::bool(l && r))
}

pub fn logical_or(left: &Value, right: &Value) -> OpResult {
    let (l, r) = logical("OR", left, right)?;
    Ok(Value::bool(l || r))
}

/// Checks one operand of a string concatenation.
pub fn concat_operand(value: &Value, side: &str) -> Result<(), String> {
    match value.ty() {
        ValueType::Acl | ValueType::Ident => Err(format!(
            "{} type could not use for {side} concatenation expression",
            value.ty()
        )),
        ValueType::String | ValueType::Bool => Ok(()),
        ty if value.literal => Err(format!(
            "{ty} type could not use as literal for {side} concatenation expression"
        )),
        _ => Ok(()),
    }
}

pub fn concat(left: &Value, right: &Value) -> OpResult {
    concat_operand(left, "left")?;
    concat_operand(right, "right")?;
    let mut out = left.render();
    out.push_str(&right.render());
    Ok(Value::string(out))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{compare, concat, equal, logical_and, regex_match, regex_not_match};
    use crate::acl::{Acl, AclEntry};
    use crate::ast::BinaryOp;
    use crate::value::Value;

    #[test]
    fn equality_requires_matching_types_and_derived_left() {
        assert!(equal(&Value::string("a"), &Value::int(1)).is_err());
        assert!(equal(&Value::string("a").into_literal(), &Value::string("a")).is_err());
        let eq = equal(&Value::string("GET"), &Value::string("GET").into_literal()).expect("eq");
        assert_eq!(eq.as_bool(), Some(true));
    }

    #[test]
    fn rtime_compares_in_seconds_against_integers() {
        let gt = compare(BinaryOp::Gt, &Value::rtime(61_500), &Value::int(60)).expect("gt");
        assert_eq!(gt.as_bool(), Some(true));
        let err = compare(BinaryOp::Gt, &Value::rtime(1000), &Value::int(1).into_literal());
        assert_eq!(err.unwrap_err(), "Right INTEGER type could not be a literal");
    }

    #[test]
    fn regex_writes_capture_groups() {
        let mut caps = Vec::new();
        let hit = regex_match(
            &Value::string("/users/42"),
            &Value::string("^/users/([0-9]+)$").into_literal(),
            &mut caps,
        )
        .expect("match");
        assert_eq!(hit.as_bool(), Some(true));
        assert_eq!(caps, vec!["/users/42".to_string(), "42".to_string()]);
        let miss = regex_not_match(&Value::string("/"), &Value::string("^/x"), &mut caps)
            .expect("not match");
        assert_eq!(miss.as_bool(), Some(true));
    }

    #[test]
    fn acl_membership_honours_negation() {
        let acl = Acl {
            name: "internal".to_string(),
            entries: vec![
                AclEntry {
                    negated: false,
                    network: "10.0.0.0".parse().expect("ip"),
                    prefix: 8,
                },
                AclEntry {
                    negated: true,
                    network: "10.1.0.0".parse().expect("ip"),
                    prefix: 16,
                },
            ],
        };
        let acl = Value::acl(Arc::new(acl));
        let mut caps = Vec::new();
        let inside = Value::ip("10.2.3.4".parse().expect("ip"));
        let excluded = Value::ip("10.1.3.4".parse().expect("ip"));
        assert_eq!(regex_match(&inside, &acl, &mut caps).expect("acl").as_bool(), Some(true));
        assert_eq!(regex_match(&excluded, &acl, &mut caps).expect("acl").as_bool(), Some(false));
    }

    #[test]
    fn concat_rejects_non_string_literals() {
        assert!(concat(&Value::string("a"), &Value::int(1).into_literal()).is_err());
        let joined = concat(&Value::string("n="), &Value::int(1)).expect("concat");
        assert_eq!(joined.render(), "n=1");
        assert!(logical_and(&Value::bool(true), &Value::string("x")).is_err());
    }
}
