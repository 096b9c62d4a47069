//! Filter tokens, address windows and the range analyzer
use crate::arch::{CachePolicy, PagingBackend, PrivilegeContext};
use crate::error::{InspectError, InspectResult};
use crate::range::PageRange;
use std::str::FromStr;

/// One user-facing filter token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterToken {
    Writeable,
    NotWriteable,
    Executable,
    NotExecutable,
    WriteableOrExecutable,
    ReadOnly,
    User,
    NotUser,
    Supervisor,
    NotSupervisor,
    WriteBack,
    NotWriteBack,
    Uncacheable,
    NotUncacheable,
}

impl FilterToken {
    fn is_cache_token(&self) -> bool {
        matches!(
            self,
            FilterToken::WriteBack
                | FilterToken::NotWriteBack
                | FilterToken::Uncacheable
                | FilterToken::NotUncacheable
        )
    }
}

impl FromStr for FilterToken {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = match s {
            "w" => FilterToken::Writeable,
            "_w" => FilterToken::NotWriteable,
            "x" => FilterToken::Executable,
            "_x" => FilterToken::NotExecutable,
            "w|x" | "x|w" => FilterToken::WriteableOrExecutable,
            "ro" => FilterToken::ReadOnly,
            "u" => FilterToken::User,
            "_u" => FilterToken::NotUser,
            "s" => FilterToken::Supervisor,
            "_s" => FilterToken::NotSupervisor,
            "wb" => FilterToken::WriteBack,
            "_wb" => FilterToken::NotWriteBack,
            "uc" => FilterToken::Uncacheable,
            "_uc" => FilterToken::NotUncacheable,
            other => return Err(other.to_string()),
        };
        Ok(token)
    }
}

/// Positional constraints, all optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowArgs {
    /// Inclusive virtual address bounds.
    pub range: Option<(u64, u64)>,
    pub contains: Option<u64>,
    pub before: Option<u64>,
    pub after: Option<u64>,
}

/// Trim bounds applied to the first and last surviving range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressWindow {
    pub min: Option<u64>,
    pub max: Option<u64>,
}

impl AddressWindow {
    pub fn is_empty(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }
}

/// Resolved predicate, evaluated without any string handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Predicate {
    Token(FilterToken),
    Within { start: u64, end: u64 },
    Contains(u64),
    Before(u64),
    After(u64),
}

/// Conjunction of predicates interpreted in one privilege context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeFilter {
    predicates: Vec<Predicate>,
    context: PrivilegeContext,
}

impl RangeFilter {
    pub fn context(&self) -> PrivilegeContext {
        self.context
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn matches(&self, range: &PageRange) -> bool {
        self.predicates.iter().all(|p| self.eval(p, range))
    }

    fn eval(&self, predicate: &Predicate, range: &PageRange) -> bool {
        let perms = &range.permissions;
        let ctx = self.context;
        match *predicate {
            Predicate::Token(token) => match token {
                FilterToken::Writeable => perms.writeable_in(ctx),
                FilterToken::NotWriteable => !perms.writeable_in(ctx),
                FilterToken::Executable => perms.executable_in(ctx),
                FilterToken::NotExecutable => !perms.executable_in(ctx),
                FilterToken::WriteableOrExecutable => {
                    perms.writeable_in(ctx) || perms.executable_in(ctx)
                }
                FilterToken::ReadOnly => !perms.writeable_in(ctx) && !perms.executable_in(ctx),
                FilterToken::User => perms.is_user(),
                FilterToken::NotUser => !perms.is_user(),
                FilterToken::Supervisor => perms.is_supervisor(),
                FilterToken::NotSupervisor => !perms.is_supervisor(),
                FilterToken::WriteBack => perms.cache == CachePolicy::WriteBack,
                FilterToken::NotWriteBack => perms.cache != CachePolicy::WriteBack,
                FilterToken::Uncacheable => perms.cache.is_uncacheable(),
                FilterToken::NotUncacheable => !perms.cache.is_uncacheable(),
            },
            Predicate::Within { start, end } => {
                range.virtual_address >= start && range.virtual_address <= end
            }
            Predicate::Contains(address) => range.contains(address),
            Predicate::Before(address) => range.virtual_address < address,
            Predicate::After(address) => range.end() > address,
        }
    }
}

/// Resolve tokens and window arguments into one filter and one window.
///
/// Fails on the first token the backend cannot interpret.
pub fn build_filter<S: AsRef<str>>(
    tokens: &[S],
    window: &WindowArgs,
    backend: &dyn PagingBackend,
) -> InspectResult<(RangeFilter, AddressWindow)> {
    let mut predicates = Vec::with_capacity(tokens.len() + 4);
    let mut supervisor = false;
    let mut user = false;

    for raw in tokens {
        let raw = raw.as_ref();
        let unknown = || InspectError::UnknownFilterToken {
            token: raw.to_string(),
            architecture: backend.architecture().to_string(),
        };
        let token: FilterToken = raw.parse().map_err(|_| unknown())?;
        if token.is_cache_token() && !backend.supports_cache_filters() {
            return Err(unknown());
        }
        match token {
            FilterToken::Supervisor => supervisor = true,
            FilterToken::User => user = true,
            _ => {}
        }
        predicates.push(Predicate::Token(token));
    }

    let context = if supervisor || user {
        PrivilegeContext { supervisor, user }
    } else {
        PrivilegeContext::ALL
    };

    let mut bounds = AddressWindow::default();
    if let Some((start, end)) = window.range {
        if start > end {
            return Err(InspectError::invalid_argument(format!(
                "range start {:#x} is above range end {:#x}",
                start, end
            )));
        }
        predicates.push(Predicate::Within { start, end });
        bounds.min = Some(start);
        bounds.max = Some(end);
    }
    if let Some(address) = window.contains {
        predicates.push(Predicate::Contains(address));
    }
    if let Some(address) = window.after {
        predicates.push(Predicate::After(address));
        bounds.min = Some(bounds.min.map_or(address, |m| m.max(address)));
    }
    if let Some(address) = window.before {
        predicates.push(Predicate::Before(address));
        bounds.max = Some(bounds.max.map_or(address, |m| m.min(address)));
    }

    Ok((RangeFilter { predicates, context }, bounds))
}

/// Keep the ranges the filter accepts and trim the outermost ones to the window.
pub fn analyze(ranges: &[PageRange], filter: &RangeFilter, window: &AddressWindow) -> Vec<PageRange> {
    let mut kept: Vec<PageRange> = ranges
        .iter()
        .filter(|range| filter.matches(range))
        .cloned()
        .collect();

    if let (Some(min), Some(first)) = (window.min, kept.first_mut()) {
        first.cut_after(min);
    }
    if let (Some(max), Some(last)) = (window.max, kept.last_mut()) {
        last.cut_before(max);
    }
    kept
}
