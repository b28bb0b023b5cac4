//! Attach and detach probes on a [`ProbeBackend`]

use super::symbols::SymbolResolver;
use super::{LinkId, ProbeBackend};
use crate::config::{AttachPoint, AttachTarget, LoadParams, ProbeKind};
use crate::error::AttachFailure;
use crate::{Result, TracekitError};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Proof that one program entry point is attached to one kernel hook
///
/// Not clonable: the handle is the only way to detach the link.
#[derive(Debug)]
pub struct AttachmentHandle {
    id: u64,
    entry_point: String,
    kind: ProbeKind,
    /// Resolved symbol or interface name
    target: String,
    /// Primary symbol that was missing when the fallback was used
    fallback_from: Option<String>,
    link: Option<LinkId>,
}

impl AttachmentHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn kind(&self) -> ProbeKind {
        self.kind
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn used_fallback(&self) -> bool {
        self.fallback_from.is_some()
    }

    pub fn fallback_from(&self) -> Option<&str> {
        self.fallback_from.as_deref()
    }

    pub fn is_attached(&self) -> bool {
        self.link.is_some()
    }
}

/// Resolves, loads and attaches programs, and undoes it again
///
/// Programs are loaded once per entry point and unloaded when their last
/// attachment is detached.
pub struct AttachmentManager<B, R> {
    backend: B,
    resolver: R,
    load_params: LoadParams,
    active: HashSet<(String, ProbeKind)>,
    loaded: HashMap<String, usize>,
    next_id: u64,
}

impl<B: ProbeBackend, R: SymbolResolver> AttachmentManager<B, R> {
    pub fn new(backend: B, resolver: R, load_params: LoadParams) -> Self {
        Self {
            backend,
            resolver,
            load_params,
            active: HashSet::new(),
            loaded: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Number of live attachments
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn attach(&mut self, point: &AttachPoint) -> Result<AttachmentHandle> {
        let resolved = self.resolve(point)?;
        let entry_point = resolved.entry_point;
        let target = resolved.target;

        if self.active.contains(&(target.clone(), point.kind)) {
            return Err(TracekitError::Attach {
                entry_point,
                target,
                kind: AttachFailure::AlreadyAttached,
                reason: format!("an {} is already attached there", point.kind),
            });
        }

        let loaded_here = !self.loaded.contains_key(&entry_point);
        if loaded_here {
            debug!("Loading program {} as {}", entry_point, point.kind);
            self.backend
                .load_program(&entry_point, point.kind, &self.load_params)?;
        }

        let link = match self
            .backend
            .attach_program(&entry_point, point.kind, &target)
        {
            Ok(link) => link,
            Err(e) => {
                if loaded_here {
                    if let Err(unload_err) = self.backend.unload_program(&entry_point) {
                        warn!(
                            "Failed to unload {} after attach failure: {}",
                            entry_point, unload_err
                        );
                    }
                }
                return Err(e);
            }
        };

        *self.loaded.entry(entry_point.clone()).or_insert(0) += 1;
        self.active.insert((target.clone(), point.kind));
        self.next_id += 1;

        info!(
            "Attached {} to {} ({}, {})",
            entry_point, target, point.kind, link
        );

        Ok(AttachmentHandle {
            id: self.next_id,
            entry_point,
            kind: point.kind,
            target,
            fallback_from: resolved.fallback_from,
            link: Some(link),
        })
    }

    /// Detach a handle. Detaching an already detached handle does nothing.
    pub fn detach(&mut self, handle: &mut AttachmentHandle) -> Result<()> {
        let Some(link) = handle.link.take() else {
            return Ok(());
        };

        self.active.remove(&(handle.target.clone(), handle.kind));
        let result = self.backend.detach_program(&handle.entry_point, link);

        let remaining = match self.loaded.get_mut(&handle.entry_point) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining == 0 && self.loaded.remove(&handle.entry_point).is_some() {
            if let Err(e) = self.backend.unload_program(&handle.entry_point) {
                warn!("Failed to unload {}: {}", handle.entry_point, e);
            }
        }

        result?;
        info!("Detached {} from {}", handle.entry_point, handle.target);
        Ok(())
    }

    /// Pick the symbol to attach to, primary then fallback, and the
    /// program that matches it
    fn resolve(&self, point: &AttachPoint) -> Result<Resolved> {
        let symbol = match &point.target {
            AttachTarget::Interface(device) => {
                return Ok(Resolved {
                    entry_point: point.entry_point.clone(),
                    target: device.clone(),
                    fallback_from: None,
                })
            }
            AttachTarget::Symbol(symbol) => symbol,
        };

        if self.resolver.contains(&symbol.primary) {
            return Ok(Resolved {
                entry_point: point.entry_point.clone(),
                target: symbol.primary.clone(),
                fallback_from: None,
            });
        }

        match &symbol.fallback {
            Some(fallback) if self.resolver.contains(fallback) => {
                let entry_point = point
                    .fallback_entry_point
                    .clone()
                    .unwrap_or_else(|| point.entry_point.clone());
                warn!(
                    "Kernel symbol {} not found, attaching {} to fallback {} instead",
                    symbol.primary, entry_point, fallback
                );
                Ok(Resolved {
                    entry_point,
                    target: fallback.clone(),
                    fallback_from: Some(symbol.primary.clone()),
                })
            }
            fallback => Err(TracekitError::SymbolNotFound {
                primary: symbol.primary.clone(),
                fallback: fallback.clone(),
            }),
        }
    }
}

struct Resolved {
    entry_point: String,
    target: String,
    fallback_from: Option<String>,
}
