// Copyright (C) 2025 The Sentinel Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tenant isolation guard.
//!
//! Query templates pass through [`inject_tenant_filter`] before being
//! prepared, so every tenant-scoped statement carries a
//! `tenant_id = :tenant_id` predicate bound as a parameter. The guard is a
//! defense in depth on top of the database's own row filters and must not
//! be skipped; it never concatenates the tenant value into the SQL text.

use crate::auth::TenantContext;
use crate::error::ServiceError;

/// Column the filter predicate is written against.
pub const TENANT_COLUMN: &str = "tenant_id";

/// Check whether `ctx` may touch rows of `target_tenant`.
///
/// Allowed when the context is system, has the `admin` role, or its tenant
/// equals the target. An empty target tenant is guard misuse.
pub fn check_access(ctx: &TenantContext, target_tenant: &str) -> Result<(), ServiceError> {
    if target_tenant.is_empty() {
        return Err(ServiceError::GuardMisuse("empty target tenant".to_string()));
    }
    if ctx.bypasses_tenant_isolation() || ctx.tenant_id == target_tenant {
        return Ok(());
    }
    Err(ServiceError::CrossTenantAccess {
        context: ctx.tenant_id.clone(),
        requested: target_tenant.to_string(),
    })
}

/// Rewrite a query template so it filters on the tenant column.
///
/// The first `WHERE` keyword that sits outside quoted literals and on word
/// boundaries gains `tenant_id = :tenant_id AND` right after it. Without a
/// `WHERE`, the predicate is inserted before the earliest `ORDER BY` or
/// `GROUP BY`, or appended when neither is present. The caller binds the
/// tenant value to `:tenant_id`.
pub fn inject_tenant_filter(sql: &str) -> Result<String, ServiceError> {
    if sql.trim().is_empty() {
        return Err(ServiceError::GuardMisuse("empty SQL template".to_string()));
    }

    let scan = scan_keywords(sql);
    if let Some(pos) = scan.where_pos {
        let insert_at = pos + "WHERE".len();
        let mut out = String::with_capacity(sql.len() + 32);
        out.push_str(&sql[..insert_at]);
        out.push_str(&format!(" {TENANT_COLUMN} = :tenant_id AND"));
        out.push_str(&sql[insert_at..]);
        return Ok(out);
    }

    let clause_pos = match (scan.order_pos, scan.group_pos) {
        (Some(o), Some(g)) => Some(o.min(g)),
        (Some(o), None) => Some(o),
        (None, Some(g)) => Some(g),
        (None, None) => None,
    };

    match clause_pos {
        Some(pos) => {
            let mut out = String::with_capacity(sql.len() + 32);
            out.push_str(&sql[..pos]);
            if !out.ends_with(char::is_whitespace) {
                out.push(' ');
            }
            out.push_str(&format!("WHERE {TENANT_COLUMN} = :tenant_id "));
            out.push_str(&sql[pos..]);
            Ok(out)
        }
        None => Ok(format!(
            "{} WHERE {TENANT_COLUMN} = :tenant_id",
            sql.trim_end()
        )),
    }
}

#[derive(Debug, Default)]
struct KeywordScan {
    where_pos: Option<usize>,
    order_pos: Option<usize>,
    group_pos: Option<usize>,
}

/// Single pass over the template recording the first position of each
/// interesting keyword, skipping single- and double-quoted regions and
/// requiring non-identifier characters on both sides. Case-insensitive.
fn scan_keywords(sql: &str) -> KeywordScan {
    let bytes = sql.as_bytes();
    let mut scan = KeywordScan::default();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' => i = skip_quoted(bytes, i, b'\''),
            b'"' => i = skip_quoted(bytes, i, b'"'),
            b if is_ident_byte(b) => {
                let start = i;
                while i < bytes.len() && is_ident_byte(bytes[i]) {
                    i += 1;
                }
                // Word boundary on the left: start of string or the
                // previous byte was consumed as non-identifier.
                let word = &sql[start..i];
                if scan.where_pos.is_none() && word.eq_ignore_ascii_case("WHERE") {
                    scan.where_pos = Some(start);
                } else if scan.order_pos.is_none()
                    && word.eq_ignore_ascii_case("ORDER")
                    && followed_by_by(sql, i)
                {
                    scan.order_pos = Some(start);
                } else if scan.group_pos.is_none()
                    && word.eq_ignore_ascii_case("GROUP")
                    && followed_by_by(sql, i)
                {
                    scan.group_pos = Some(start);
                }
            }
            _ => i += 1,
        }
    }

    scan
}

/// Advance past a quoted literal, honoring doubled-quote escapes.
fn skip_quoted(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if i + 1 < bytes.len() && bytes[i + 1] == quote {
                i += 2; // escaped quote inside the literal
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b == b'#'
}

/// Whether the next word after position `i` (skipping whitespace) is `BY`.
fn followed_by_by(sql: &str, i: usize) -> bool {
    let rest = sql[i..].trim_start();
    let Some(word) = rest.split(|c: char| !is_ident_byte(c as u8)).next() else {
        return false;
    };
    word.eq_ignore_ascii_case("BY")
}
