//! Stage catalog: the immutable, ordered table of initialization stages.
//!
//! ## Architecture
//!
//! ```text
//! EmptyNode → ProtocolInfo → FailedCheck → Ping → Details → ... → StaticEnd
//!                                                                   │
//!   heal marker ─────────────────────────────────────────→ SessionStart
//!                                                                   │
//!                     DynamicValues → DeleteRoutes → ReturnRoutes → Neighbors → Done
//! ```
//!
//! A catalog is built once at startup and shared as `Arc<StageCatalog>`.
//! Lookups by stage, by order and by successor are table lookups; the
//! scheduler performs them on every transition of every node.
//!
//! Stages at or after the heal marker that are not persisted form the heal
//! subset, re-run on every heal without touching static data.

mod stage;

pub use stage::{Reach, Stage, StageFlags, StageSpec};

use nodeinit_shared::{NodeinitError, NodeinitResult};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Persisted, stage-keyed results of completed static stages.
pub type StaticData = BTreeMap<Stage, Vec<u8>>;

const SLOTS: usize = Stage::ALL.len();

#[derive(Debug, Clone)]
pub struct StageCatalog {
    /// Entries sorted by order.
    entries: Vec<StageSpec>,
    /// Stage index → position in `entries`.
    position: [Option<usize>; SLOTS],
    by_order: HashMap<u32, Stage>,
    /// Stage index → next heal stage.
    heal_successor: [Option<Stage>; SLOTS],
    heal_stages: Vec<Stage>,
    heal_marker: Stage,
}

impl StageCatalog {
    /// Build a catalog from entries in any order.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the table is empty, a stage or order repeats, the
    /// heal marker is not part of the table, or no stage qualifies for heal.
    pub fn new(mut entries: Vec<StageSpec>, heal_marker: Stage) -> NodeinitResult<Self> {
        if entries.is_empty() {
            return Err(NodeinitError::Config("stage catalog is empty".into()));
        }

        entries.sort_by_key(|spec| spec.order);

        let mut position = [None; SLOTS];
        let mut by_order = HashMap::with_capacity(entries.len());
        let mut seen_orders = HashSet::with_capacity(entries.len());

        for (pos, spec) in entries.iter().enumerate() {
            if position[spec.stage.index()].is_some() {
                return Err(NodeinitError::Config(format!(
                    "stage {} appears twice in catalog",
                    spec.stage
                )));
            }
            if !seen_orders.insert(spec.order) {
                return Err(NodeinitError::Config(format!(
                    "order {} is used by more than one stage",
                    spec.order
                )));
            }
            position[spec.stage.index()] = Some(pos);
            by_order.insert(spec.order, spec.stage);
        }

        let marker_pos = position[heal_marker.index()].ok_or_else(|| {
            NodeinitError::Config(format!("heal marker {} is not in catalog", heal_marker))
        })?;

        let heal_stages: Vec<Stage> = entries[marker_pos..]
            .iter()
            .filter(|spec| !spec.is_persisted())
            .map(|spec| spec.stage)
            .collect();

        if heal_stages.is_empty() {
            return Err(NodeinitError::Config(format!(
                "no non-persisted stage at or after heal marker {}",
                heal_marker
            )));
        }

        let mut heal_successor = [None; SLOTS];
        for pair in heal_stages.windows(2) {
            heal_successor[pair[0].index()] = Some(pair[1]);
        }

        Ok(Self {
            entries,
            position,
            by_order,
            heal_successor,
            heal_stages,
            heal_marker,
        })
    }

    /// The Z-Wave style catalog used unless a caller supplies its own.
    pub fn standard() -> Self {
        use Reach::{Local, Routed};

        let entries = vec![
            StageSpec::new(Stage::EmptyNode, 0, StageFlags::mandatory_dynamic(), Local),
            StageSpec::new(Stage::ProtocolInfo, 1, StageFlags::mandatory_static(), Local),
            StageSpec::new(Stage::FailedCheck, 2, StageFlags::mandatory_dynamic(), Local),
            StageSpec::new(Stage::Ping, 3, StageFlags::mandatory_dynamic(), Routed),
            StageSpec::new(Stage::Details, 4, StageFlags::mandatory_static(), Routed),
            StageSpec::new(Stage::SecurityReport, 5, StageFlags::optional_static(), Routed),
            StageSpec::new(Stage::Manufacturer, 6, StageFlags::mandatory_static(), Routed),
            StageSpec::new(Stage::Version, 7, StageFlags::optional_static(), Routed),
            StageSpec::new(Stage::Endpoints, 8, StageFlags::optional_static(), Routed),
            StageSpec::new(Stage::Associations, 9, StageFlags::optional_static(), Routed),
            StageSpec::new(Stage::SetLifeline, 10, StageFlags::optional_dynamic(), Routed),
            StageSpec::new(Stage::Configuration, 11, StageFlags::optional_static(), Routed),
            StageSpec::new(Stage::StaticEnd, 12, StageFlags::mandatory_dynamic(), Local),
            StageSpec::new(Stage::SessionStart, 13, StageFlags::mandatory_dynamic(), Local),
            StageSpec::new(Stage::DynamicValues, 14, StageFlags::optional_dynamic(), Routed),
            StageSpec::new(Stage::DeleteRoutes, 15, StageFlags::optional_dynamic(), Local),
            StageSpec::new(Stage::ReturnRoutes, 16, StageFlags::optional_dynamic(), Routed),
            StageSpec::new(Stage::Neighbors, 17, StageFlags::optional_dynamic(), Routed),
            StageSpec::new(Stage::Done, 18, StageFlags::mandatory_dynamic(), Local),
        ];

        match Self::new(entries, Stage::SessionStart) {
            Ok(catalog) => catalog,
            // The table above is fixed; a failure here is a programming error
            // caught by the unit tests.
            Err(e) => unreachable!("standard catalog is invalid: {}", e),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StageSpec> {
        self.entries.iter()
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.position[stage.index()].is_some()
    }

    pub fn spec(&self, stage: Stage) -> Option<&StageSpec> {
        self.position[stage.index()].map(|pos| &self.entries[pos])
    }

    /// Look a stage up by its numeric order.
    pub fn stage_at(&self, order: u32) -> Option<Stage> {
        self.by_order.get(&order).copied()
    }

    pub fn initial(&self) -> Stage {
        self.entries[0].stage
    }

    pub fn terminal(&self) -> Stage {
        self.entries[self.entries.len() - 1].stage
    }

    pub fn is_terminal(&self, stage: Stage) -> bool {
        stage == self.terminal()
    }

    /// Stage with the next larger order, or `None` for the terminal stage
    /// and for stages outside this catalog.
    pub fn next(&self, stage: Stage) -> Option<Stage> {
        let pos = self.position[stage.index()]?;
        self.entries.get(pos + 1).map(|spec| spec.stage)
    }

    pub fn heal_marker(&self) -> Stage {
        self.heal_marker
    }

    /// True once `stage` lies past the boundary between one-time discovery
    /// and the recurring session stages.
    pub fn is_static_complete(&self, stage: Stage) -> bool {
        match (self.spec(stage), self.spec(self.heal_marker)) {
            (Some(spec), Some(marker)) => spec.order > marker.order,
            _ => false,
        }
    }

    pub fn heal_stages(&self) -> &[Stage] {
        &self.heal_stages
    }

    pub fn first_heal_stage(&self) -> Stage {
        self.heal_stages[0]
    }

    pub fn is_heal_stage(&self, stage: Stage) -> bool {
        self.heal_stages.contains(&stage)
    }

    /// Next stage of a heal run, or `None` after the last heal stage.
    pub fn next_heal(&self, stage: Stage) -> Option<Stage> {
        self.heal_successor[stage.index()]
    }

    /// Successor of `stage` during initialization, skipping persisted stages
    /// whose results are already in `static_data`.
    pub fn next_pending(&self, stage: Stage, static_data: &StaticData) -> Option<Stage> {
        let mut candidate = self.next(stage)?;
        while self.is_covered(candidate, static_data) {
            candidate = self.next(candidate)?;
        }
        Some(candidate)
    }

    /// Stage a rehydrated session starts from: the smallest-order stage that
    /// is either dynamic or has no stored result.
    ///
    /// Falls back to the terminal stage when every stage is covered.
    pub fn resume_stage(&self, static_data: &StaticData) -> Stage {
        self.entries
            .iter()
            .find(|spec| !self.is_covered(spec.stage, static_data))
            .map(|spec| spec.stage)
            .unwrap_or_else(|| self.terminal())
    }

    fn is_covered(&self, stage: Stage, static_data: &StaticData) -> bool {
        self.spec(stage)
            .is_some_and(|spec| spec.is_persisted() && static_data.contains_key(&stage))
    }
}

impl Default for StageCatalog {
    fn default() -> Self {
        Self::standard()
    }
}
