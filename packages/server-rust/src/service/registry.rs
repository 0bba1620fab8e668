//! Operation registry: contracts compiled into immutable blueprints.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tether_core::{MemberShape, OperationKind};
use tracing::{debug, info};

use super::blueprint::{Invoker, OperationBlueprint, OperationKey};
use super::classify::{classify, ShapeError};
use super::contract::{Contract, ContractDescriptor, MemberDescriptor};
use super::middleware::PipelineBuilder;

/// Errors raised while registering a contract.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("{type_name} is not a supported contract: {reason}")]
    NotSupportedContract {
        type_name: &'static str,
        reason: String,
    },
    #[error("{contract}.{operation} has an unsupported shape: {reason}")]
    UnsupportedOperationShape {
        contract: String,
        operation: String,
        reason: String,
    },
}

type OperationTable = HashMap<String, Arc<OperationBlueprint>>;

// ---------------------------------------------------------------------------
// OperationRegistry
// ---------------------------------------------------------------------------

/// Contract name to operation name to blueprint.
///
/// Blueprints are built at most once per contract: registration of a
/// contract happens under its map entry lock, so concurrent first
/// registrations observe a single build and later ones are no-ops.
pub struct OperationRegistry {
    contracts: DashMap<String, Arc<OperationTable>>,
    pipeline: PipelineBuilder,
}

impl OperationRegistry {
    /// Creates an empty registry that builds each blueprint's pipeline from
    /// `pipeline`.
    #[must_use]
    pub fn new(pipeline: PipelineBuilder) -> Self {
        Self {
            contracts: DashMap::new(),
            pipeline,
        }
    }

    /// Registers contract `C`. Returns the number of operations it exposes.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` if the contract or one of its members cannot
    /// be dispatched. Nothing is registered in that case.
    pub fn register<C: Contract>(&self) -> Result<usize, RegistryError> {
        if let Some(table) = self.contracts.get(C::NAME) {
            debug!(contract = C::NAME, "contract already registered");
            return Ok(table.len());
        }
        self.register_descriptor(ContractDescriptor::of::<C>())
    }

    /// Registers an already described contract.
    ///
    /// # Errors
    ///
    /// See [`register`](Self::register).
    pub fn register_descriptor(&self, descriptor: ContractDescriptor) -> Result<usize, RegistryError> {
        validate_contract(&descriptor)?;
        match self.contracts.entry(descriptor.name.clone()) {
            Entry::Occupied(existing) => {
                debug!(contract = %descriptor.name, "contract already registered");
                Ok(existing.get().len())
            }
            Entry::Vacant(slot) => {
                let table = self.build_table(descriptor)?;
                let count = table.len();
                info!(contract = %slot.key(), operations = count, "contract registered");
                slot.insert(Arc::new(table));
                Ok(count)
            }
        }
    }

    fn build_table(&self, descriptor: ContractDescriptor) -> Result<OperationTable, RegistryError> {
        let ContractDescriptor {
            name: contract,
            type_id,
            type_name,
            members,
        } = descriptor;

        let mut table = OperationTable::with_capacity(members.len());
        for member in members {
            let MemberDescriptor {
                name,
                shape,
                authorization,
                config,
                invoker,
            } = member;
            let unsupported = |reason: String| RegistryError::UnsupportedOperationShape {
                contract: contract.clone(),
                operation: name.clone(),
                reason,
            };

            let kind = classify(&shape).map_err(|e: ShapeError| unsupported(e.to_string()))?;
            let invoker = invoker.ok_or_else(|| unsupported("member has no invoker".to_string()))?;
            let subscribes = matches!(invoker, Invoker::Subscribe(_));
            if subscribes != (kind == OperationKind::Subscription) {
                return Err(unsupported(format!("invoker does not match {kind} shape")));
            }

            let (params, returns) = match shape {
                MemberShape::Property { .. } => (Vec::new(), None),
                MemberShape::Method { params, returns } => (params, Some(returns)),
            };
            let key = OperationKey {
                contract: contract.clone(),
                operation: name.clone(),
            };
            let mut blueprint = OperationBlueprint::new(
                key,
                kind,
                type_id,
                type_name,
                params,
                returns,
                authorization,
                config,
                invoker,
            );
            let pipeline = self.pipeline.build(&blueprint);
            blueprint.set_pipeline(pipeline);
            debug!(
                contract = %contract,
                operation = %name,
                kind = kind.as_str(),
                stages = blueprint.pipeline().len(),
                "operation blueprint built"
            );
            table.insert(name, Arc::new(blueprint));
        }
        Ok(table)
    }

    /// Looks up a blueprint. `None` means not found, which callers report
    /// as a structured failure.
    #[must_use]
    pub fn resolve(&self, contract: &str, operation: &str) -> Option<Arc<OperationBlueprint>> {
        self.contracts.get(contract)?.get(operation).cloned()
    }

    /// All blueprints of one contract, sorted by operation name.
    #[must_use]
    pub fn operations(&self, contract: &str) -> Vec<Arc<OperationBlueprint>> {
        let mut ops: Vec<_> = self
            .contracts
            .get(contract)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default();
        ops.sort_by(|a, b| a.operation_name().cmp(b.operation_name()));
        ops
    }

    /// Every registered blueprint.
    #[must_use]
    pub fn blueprints(&self) -> Vec<Arc<OperationBlueprint>> {
        self.contracts
            .iter()
            .flat_map(|entry| entry.value().values().cloned().collect::<Vec<_>>())
            .collect()
    }

    #[must_use]
    pub fn contains_contract(&self, contract: &str) -> bool {
        self.contracts.contains_key(contract)
    }

    #[must_use]
    pub fn contract_count(&self) -> usize {
        self.contracts.len()
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new(PipelineBuilder::new())
    }
}

fn validate_contract(descriptor: &ContractDescriptor) -> Result<(), RegistryError> {
    let reject = |reason: &str| RegistryError::NotSupportedContract {
        type_name: descriptor.type_name,
        reason: reason.to_string(),
    };
    if descriptor.name.is_empty() {
        return Err(reject("contract name is empty"));
    }
    if descriptor.members.is_empty() {
        return Err(reject("contract declares no members"));
    }
    let mut seen = HashSet::with_capacity(descriptor.members.len());
    for member in &descriptor.members {
        if !seen.insert(member.name.as_str()) {
            return Err(RegistryError::NotSupportedContract {
                type_name: descriptor.type_name,
                reason: format!("member {} is declared twice", member.name),
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
