use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use clusteval_plugin_sdk::CapabilityDescriptor;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::definition::format_number;
use crate::{DataConfig, ParameterPoint, ProgramConfig, ProgramParameter, ResolvedRun, Runnable};

/// Quality values recorded by runnables that finished in an earlier
/// session, by runnable key.
pub type CompletedRunnables = HashMap<String, BTreeMap<String, String>>;

/// How an optimization method picks the parameter points it evaluates.
///
/// Read from the method descriptor's `strategy` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum OptimizationStrategy {
    /// One evenly divided grid.
    Divisive,
    /// Successive grids, each narrowed around the best point so far.
    Layered,
    /// Uniform samples from a seeded generator.
    Random { seed: u64 },
}

impl OptimizationStrategy {
    /// `None` if the descriptor names a strategy that does not exist.
    pub fn from_descriptor(descriptor: &CapabilityDescriptor) -> Option<Self> {
        match descriptor.property("strategy").unwrap_or("divisive") {
            "divisive" => Some(Self::Divisive),
            "layered" => Some(Self::Layered),
            "random" => {
                let seed = match descriptor.property("seed") {
                    Some(seed) => seed.parse().ok()?,
                    None => 0,
                };
                Some(Self::Random { seed })
            }
            _ => None,
        }
    }
}

/// Which end of a quality measure's scale is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Optimum {
    #[default]
    Maximum,
    Minimum,
}

impl Optimum {
    /// Measures declare `optimum=min` when smaller values are better.
    pub fn from_descriptor(descriptor: &CapabilityDescriptor) -> Self {
        match descriptor.property("optimum") {
            Some("min") => Optimum::Minimum,
            _ => Optimum::Maximum,
        }
    }

    pub fn is_better(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Optimum::Maximum => candidate > incumbent,
            Optimum::Minimum => candidate < incumbent,
        }
    }
}

/// The resolved optimization settings of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizationPlan {
    pub method: String,
    pub strategy: OptimizationStrategy,
    pub iterations: usize,
    /// Quality measure the layered strategy refines on.
    pub criterion: Option<String>,
}

impl OptimizationPlan {
    /// Points evaluated as soon as the run starts. A layered plan only
    /// yields its first layer here; see [`LayeredSearch`].
    pub fn initial_points(&self, program: &ProgramConfig) -> Vec<ParameterPoint> {
        let space = ParameterSpace::of(&program.parameters);
        let budget = self.iterations.max(1);
        match self.strategy {
            OptimizationStrategy::Divisive => space.grid(budget).collect(),
            OptimizationStrategy::Layered => {
                space.grid(layer_budget(budget, layer_count(budget))).collect()
            }
            OptimizationStrategy::Random { seed } => space.sample(budget, seed).collect(),
        }
    }
}

fn layer_count(iterations: usize) -> usize {
    ((iterations as f64).sqrt().floor() as usize).max(1)
}

fn layer_budget(remaining: usize, layers_left: usize) -> usize {
    if layers_left <= 1 {
        remaining
    } else {
        (remaining / 2).max(1)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Axis {
    Options(Vec<String>),
    Range { min: f64, max: f64, integral: bool },
    Fixed(String),
}

impl Axis {
    fn of(parameter: &ProgramParameter) -> Self {
        if !parameter.values.is_empty() {
            let mut seen = HashSet::new();
            let mut values = parameter.values.clone();
            values.retain(|value| seen.insert(value.clone()));
            return Axis::Options(values);
        }
        match (parameter.min, parameter.max) {
            (Some(a), Some(b)) if a.is_finite() && b.is_finite() => {
                let (mut min, mut max) = if a <= b { (a, b) } else { (b, a) };
                if parameter.integer {
                    min = min.ceil();
                    max = max.floor();
                }
                if min >= max {
                    Axis::Fixed(format_number(min))
                } else {
                    Axis::Range {
                        min,
                        max,
                        integral: parameter.integer,
                    }
                }
            }
            _ => Axis::Fixed(parameter.default.clone()),
        }
    }

    /// `divisions` evenly spaced values, fewer if whole numbers collide.
    fn candidates(&self, divisions: usize) -> Vec<String> {
        match self {
            Axis::Options(values) => values.clone(),
            Axis::Fixed(value) => vec![value.clone()],
            Axis::Range { min, max, integral } => {
                let raw: Vec<f64> = if divisions <= 1 {
                    vec![*min]
                } else {
                    (0..divisions)
                        .map(|step| min + (max - min) * step as f64 / (divisions - 1) as f64)
                        .collect()
                };
                let mut values: Vec<String> = raw
                    .into_iter()
                    .map(|value| if *integral { value.round() } else { value })
                    .map(format_number)
                    .collect();
                values.dedup();
                values
            }
        }
    }

    fn sample(&self, rng: &mut StdRng) -> String {
        match self {
            Axis::Options(values) => values[rng.gen_range(0..values.len())].clone(),
            Axis::Fixed(value) => value.clone(),
            Axis::Range { min, max, integral: true } => {
                format_number(rng.gen_range(*min as i64..=*max as i64) as f64)
            }
            Axis::Range { min, max, .. } => format_number(rng.gen_range(*min..=*max)),
        }
    }

    /// Shrinks a range to a quarter of its width on either side of `best`,
    /// staying inside `bounds`.
    fn narrowed(&self, bounds: &Axis, best: Option<f64>) -> Axis {
        let (
            Axis::Range { min, max, integral },
            Axis::Range {
                min: lower,
                max: upper,
                ..
            },
            Some(best),
        ) = (self, bounds, best)
        else {
            return self.clone();
        };
        let reach = (max - min) / 4.0;
        let mut min = (best - reach).max(*lower);
        let mut max = (best + reach).min(*upper);
        if *integral {
            min = min.floor().max(*lower);
            max = max.ceil().min(*upper);
        }
        if min < max {
            Axis::Range {
                min,
                max,
                integral: *integral,
            }
        } else {
            Axis::Fixed(format_number(min))
        }
    }
}

/// The values a program's parameters may take, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpace {
    axes: Vec<(String, Axis)>,
}

impl ParameterSpace {
    pub fn of(parameters: &[ProgramParameter]) -> Self {
        Self {
            axes: parameters
                .iter()
                .map(|parameter| (parameter.name.clone(), Axis::of(parameter)))
                .collect(),
        }
    }

    /// Divisions per axis for a grid of at most `budget` points: every
    /// listed value, and an equal share of what the listed values leave
    /// over for each numeric range.
    fn divisions(&self, budget: usize) -> Vec<usize> {
        let options = self
            .axes
            .iter()
            .filter_map(|(_, axis)| match axis {
                Axis::Options(values) => Some(values.len()),
                _ => None,
            })
            .fold(1usize, usize::saturating_mul);
        let ranges = self
            .axes
            .iter()
            .filter(|(_, axis)| matches!(axis, Axis::Range { .. }))
            .count();
        let per_range = if ranges == 0 {
            1
        } else {
            let share = (budget / options.max(1)) as f64;
            // Nudged so that exact roots such as 8^(1/3) do not floor to one less.
            ((share.powf(1.0 / ranges as f64) + 1e-9).floor() as usize).max(1)
        };
        self.axes
            .iter()
            .map(|(_, axis)| match axis {
                Axis::Options(values) => values.len(),
                Axis::Range { .. } => per_range,
                Axis::Fixed(_) => 1,
            })
            .collect()
    }

    /// Lazily walks the divided grid, stopping after `budget` points.
    pub fn grid(&self, budget: usize) -> Grid {
        let candidates: Vec<Vec<String>> = self
            .axes
            .iter()
            .zip(self.divisions(budget))
            .map(|((_, axis), divisions)| axis.candidates(divisions))
            .collect();
        Grid {
            names: self.axes.iter().map(|(name, _)| name.clone()).collect(),
            position: vec![0; candidates.len()],
            candidates,
            remaining: budget,
        }
    }

    /// `budget` uniformly drawn points; the same seed draws the same points.
    pub fn sample(&self, budget: usize, seed: u64) -> Samples {
        Samples {
            axes: self.axes.clone(),
            rng: StdRng::seed_from_u64(seed),
            remaining: budget,
        }
    }

    fn narrowed(&self, bounds: &ParameterSpace, best: &ParameterPoint) -> ParameterSpace {
        let axes = self
            .axes
            .iter()
            .zip(&bounds.axes)
            .map(|((name, axis), (_, bound))| {
                let best = best.get(name).and_then(|value| value.parse::<f64>().ok());
                (name.clone(), axis.narrowed(bound, best))
            })
            .collect();
        ParameterSpace { axes }
    }
}

/// Mixed-radix walk over per-parameter candidates; the last parameter
/// varies fastest.
#[derive(Debug)]
pub struct Grid {
    names: Vec<String>,
    candidates: Vec<Vec<String>>,
    position: Vec<usize>,
    remaining: usize,
}

impl Iterator for Grid {
    type Item = ParameterPoint;

    fn next(&mut self) -> Option<ParameterPoint> {
        if self.remaining == 0 || self.candidates.iter().any(Vec::is_empty) {
            return None;
        }
        let point = self
            .names
            .iter()
            .zip(&self.candidates)
            .zip(&self.position)
            .map(|((name, values), &index)| (name.clone(), values[index].clone()))
            .collect();
        self.remaining -= 1;

        let mut wrapped = true;
        for axis in (0..self.position.len()).rev() {
            self.position[axis] += 1;
            if self.position[axis] < self.candidates[axis].len() {
                wrapped = false;
                break;
            }
            self.position[axis] = 0;
        }
        if wrapped {
            self.remaining = 0;
        }
        Some(ParameterPoint(point))
    }
}

#[derive(Debug)]
pub struct Samples {
    axes: Vec<(String, Axis)>,
    rng: StdRng,
    remaining: usize,
}

impl Iterator for Samples {
    type Item = ParameterPoint;

    fn next(&mut self) -> Option<ParameterPoint> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let rng = &mut self.rng;
        Some(ParameterPoint(
            self.axes
                .iter()
                .map(|(name, axis)| (name.clone(), axis.sample(rng)))
                .collect(),
        ))
    }
}

/// Best parameter point found for one quality measure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestPoint {
    pub parameters: ParameterPoint,
    pub quality: f64,
}

/// Best point per quality measure among the FINISHED runnables.
pub fn best_points<'a>(
    runnables: impl IntoIterator<Item = &'a Arc<Runnable>>,
    optima: &BTreeMap<String, Optimum>,
) -> BTreeMap<String, BestPoint> {
    let mut best: BTreeMap<String, BestPoint> = BTreeMap::new();
    for runnable in runnables {
        if runnable.status() != crate::RunStatus::Finished {
            continue;
        }
        for (measure, value) in runnable.quality() {
            let Some(quality) = value.parse::<f64>().ok().filter(|q| q.is_finite()) else {
                continue;
            };
            let optimum = optima.get(&measure).copied().unwrap_or_default();
            let improves = best
                .get(&measure)
                .map_or(true, |current| optimum.is_better(quality, current.quality));
            if improves {
                best.insert(
                    measure,
                    BestPoint {
                        parameters: runnable.parameters().clone(),
                        quality,
                    },
                );
            }
        }
    }
    best
}

/// Layer-by-layer refinement of one program × data pair.
///
/// The iteration budget is spread over ⌊√iterations⌋ layers, each taking
/// half of what is left (the last takes the rest). Before every layer after
/// the first, numeric ranges shrink around the best point measured so far.
#[derive(Debug)]
pub struct LayeredSearch {
    run: Arc<ResolvedRun>,
    program: ProgramConfig,
    data: DataConfig,
    criterion: String,
    optimum: Optimum,
    bounds: ParameterSpace,
    space: ParameterSpace,
    layers_left: usize,
    remaining: usize,
    seen: HashSet<ParameterPoint>,
    members: Vec<Arc<Runnable>>,
    layer_start: usize,
}

impl LayeredSearch {
    pub(crate) fn new(
        run: &Arc<ResolvedRun>,
        program: &ProgramConfig,
        data: &DataConfig,
        criterion: &str,
        iterations: usize,
    ) -> Self {
        let bounds = ParameterSpace::of(&program.parameters);
        let iterations = iterations.max(1);
        Self {
            optimum: run.optima.get(criterion).copied().unwrap_or_default(),
            run: Arc::clone(run),
            program: program.clone(),
            data: data.clone(),
            criterion: criterion.to_string(),
            space: bounds.clone(),
            bounds,
            layers_left: layer_count(iterations),
            remaining: iterations,
            seen: HashSet::new(),
            members: Vec::new(),
            layer_start: 0,
        }
    }

    pub fn program(&self) -> &str {
        &self.program.name
    }

    pub fn data(&self) -> &str {
        &self.data.name
    }

    pub fn is_exhausted(&self) -> bool {
        self.layers_left == 0 || self.remaining == 0
    }

    /// Points the search may still add.
    pub fn remaining(&self) -> usize {
        if self.layers_left == 0 {
            0
        } else {
            self.remaining
        }
    }

    /// Whether every runnable of the latest layer reached a terminal status.
    pub fn layer_settled(&self) -> bool {
        self.members[self.layer_start..]
            .iter()
            .all(|runnable| runnable.status().is_terminal())
    }

    pub fn best(&self) -> Option<BestPoint> {
        let optima = BTreeMap::from([(self.criterion.clone(), self.optimum)]);
        best_points(&self.members, &optima).remove(&self.criterion)
    }

    /// Stops generating layers.
    pub fn close(&mut self) {
        self.layers_left = 0;
    }

    /// Builds the next layer around the best point so far. Points this
    /// search already evaluated are skipped, and a layer left empty by that
    /// is followed by the next one straight away. Empty once exhausted.
    pub fn advance(&mut self, completed: &CompletedRunnables) -> Vec<Arc<Runnable>> {
        while !self.is_exhausted() {
            if let Some(best) = self.best() {
                self.space = self.space.narrowed(&self.bounds, &best.parameters);
            }
            let budget = layer_budget(self.remaining, self.layers_left);
            let points: Vec<ParameterPoint> = self.space.grid(budget).collect();
            self.remaining = self.remaining.saturating_sub(points.len());
            self.layers_left -= 1;

            let layer: Vec<Arc<Runnable>> = points
                .into_iter()
                .filter(|point| self.seen.insert(point.clone()))
                .map(|point| {
                    Runnable::clustering(&self.run, &self.program, &self.data, point, completed)
                })
                .collect();
            if !layer.is_empty() {
                self.layer_start = self.members.len();
                self.members.extend(layer.iter().cloned());
                return layer;
            }
        }
        Vec::new()
    }
}
