//! Stage contracts.
//!
//! Every stage declares which fields it may change, which it may remove
//! (and when), and whether it may delete nodes or edges. [`verify`] diffs a
//! before/after snapshot of the graph against that declaration. A violation
//! is a programming defect in the stage, not a user error.

mod diff;

pub use diff::*;

use serde::Serialize;

use crate::pipeline::Stage;

/// Part of the graph a field belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Graph,
    Node,
    NodeData,
    Edge,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Scope::Graph => "graph",
            Scope::Node => "node",
            Scope::NodeData => "node.data",
            Scope::Edge => "edge",
        };
        write!(f, "{}", s)
    }
}

/// Fields whose value may change but which must stay present.
#[derive(Debug, Clone, Copy)]
pub struct FieldSet {
    pub graph: &'static [&'static str],
    pub node: &'static [&'static str],
    pub node_data: &'static [&'static str],
    pub edge: &'static [&'static str],
}

impl FieldSet {
    pub const NONE: FieldSet = FieldSet {
        graph: &[],
        node: &[],
        node_data: &[],
        edge: &[],
    };

    pub fn fields(&self, scope: Scope) -> &'static [&'static str] {
        match scope {
            Scope::Graph => self.graph,
            Scope::Node => self.node,
            Scope::NodeData => self.node_data,
            Scope::Edge => self.edge,
        }
    }

    pub fn allows(&self, scope: Scope, field: &str) -> bool {
        self.fields(scope).contains(&field)
    }
}

/// Condition under which a drop is sanctioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPrecondition {
    /// The node carries a `factor_reclassified` correction from this stage.
    Reclassified,
    /// The same value is now present under the named field.
    RenamedTo(&'static str),
}

/// A field that may disappear entirely.
#[derive(Debug, Clone, Copy)]
pub struct AllowedDrop {
    pub scope: Scope,
    pub field: &'static str,
    pub precondition: DropPrecondition,
}

/// Whether whole nodes or edges may be deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removals {
    pub nodes: bool,
    pub edges: bool,
}

impl Removals {
    pub const NONE: Removals = Removals {
        nodes: false,
        edges: false,
    };
}

/// Static declaration of what a stage may change.
#[derive(Debug, Clone, Copy)]
pub struct StageContract {
    pub stage: Stage,
    pub allowed_modifications: FieldSet,
    pub allowed_drops: &'static [AllowedDrop],
    pub allowed_removals: Removals,
}

impl StageContract {
    /// Find the drop rule for a field, if any.
    pub fn drop_rule(&self, scope: Scope, field: &str) -> Option<&AllowedDrop> {
        self.allowed_drops
            .iter()
            .find(|d| d.scope == scope && d.field == field)
    }

    /// A contract that permits no change at all.
    const fn read_only(stage: Stage) -> Self {
        Self {
            stage,
            allowed_modifications: FieldSet::NONE,
            allowed_drops: &[],
            allowed_removals: Removals::NONE,
        }
    }
}

pub const PARSE_CONTRACT: StageContract = StageContract {
    stage: Stage::Parse,
    allowed_modifications: FieldSet {
        graph: &["version"],
        node: &[],
        node_data: &[],
        edge: &["id", "belief_exists"],
    },
    allowed_drops: &[AllowedDrop {
        scope: Scope::Edge,
        field: "exists_probability",
        precondition: DropPrecondition::RenamedTo("belief_exists"),
    }],
    allowed_removals: Removals::NONE,
};

pub const NORMALISE_CONTRACT: StageContract = StageContract {
    stage: Stage::Normalise,
    allowed_modifications: FieldSet {
        graph: &[],
        node: &["kind", "category"],
        node_data: &["goal_threshold"],
        edge: &["from", "to", "strength_mean", "strength_std", "belief_exists"],
    },
    allowed_drops: &[
        AllowedDrop {
            scope: Scope::NodeData,
            field: "factor_type",
            precondition: DropPrecondition::Reclassified,
        },
        AllowedDrop {
            scope: Scope::NodeData,
            field: "uncertainty_drivers",
            precondition: DropPrecondition::Reclassified,
        },
    ],
    allowed_removals: Removals::NONE,
};

pub const ENRICH_CONTRACT: StageContract = StageContract::read_only(Stage::Enrich);

pub const REPAIR_CONTRACT: StageContract = StageContract {
    stage: Stage::Repair,
    allowed_modifications: FieldSet {
        graph: &[],
        node: &["category"],
        node_data: &[],
        edge: &["from", "to"],
    },
    allowed_drops: &[],
    allowed_removals: Removals {
        nodes: false,
        edges: true,
    },
};

pub const THRESHOLD_SWEEP_CONTRACT: StageContract =
    StageContract::read_only(Stage::ThresholdSweep);

pub const PACKAGE_CONTRACT: StageContract = StageContract::read_only(Stage::Package);

pub const BOUNDARY_CONTRACT: StageContract = StageContract::read_only(Stage::Boundary);

/// Contract for a stage.
pub fn contract_for(stage: Stage) -> &'static StageContract {
    match stage {
        Stage::Parse => &PARSE_CONTRACT,
        Stage::Normalise => &NORMALISE_CONTRACT,
        Stage::Enrich => &ENRICH_CONTRACT,
        Stage::Repair => &REPAIR_CONTRACT,
        Stage::ThresholdSweep => &THRESHOLD_SWEEP_CONTRACT,
        Stage::Package => &PACKAGE_CONTRACT,
        Stage::Boundary => &BOUNDARY_CONTRACT,
    }
}
