//! Gradient-free training: a fixed-size population of real-valued genomes,
//! usually the flattened weights of a [`Network`].

use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, Uniform};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::network::Network;
use crate::Tensor;

/// Maps a genome to its fitness scalars. Lower is better.
pub type FitnessFn<'a> = Box<dyn FnMut(&[f64]) -> Result<Vec<f64>> + 'a>;

/// Collapses fitness scalars into one grade, given the configured weights.
pub type GradeFn = fn(&[f64], &[f64]) -> f64;

/// Produces a child genome from two parents.
pub type MateFn = fn(&[f64], &[f64], &mut StdRng) -> Vec<f64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionConfig {
    /// Fraction of the population kept each generation
    pub survival_rate: f64,
    /// Per-gene probability that an offspring gene is perturbed
    pub mutation_rate: f64,
    /// Standard deviation of the gaussian perturbation
    pub mutation_delta: f64,
    /// Weights for the default grade; missing entries count as 1
    pub fitness_weights: Vec<f64>,
    /// Initial genes are drawn from `[-init_range, init_range]`
    pub init_range: f64,
    pub seed: Option<u64>,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        EvolutionConfig {
            survival_rate: 0.5,
            mutation_rate: 0.1,
            mutation_delta: 0.1,
            fitness_weights: vec![1.0],
            init_range: 1.0,
            seed: None,
        }
    }
}

impl EvolutionConfig {
    fn validate(&self) -> Result<()> {
        if !(self.survival_rate > 0.0 && self.survival_rate <= 1.0) {
            return Err(Error::config(format!(
                "survival rate must lie in (0, 1], got {}",
                self.survival_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.mutation_rate) {
            return Err(Error::config(format!(
                "mutation rate must lie in [0, 1], got {}",
                self.mutation_rate
            )));
        }
        for (name, value) in [("mutation delta", self.mutation_delta), ("init range", self.init_range)] {
            if !(value >= 0.0 && value.is_finite()) {
                return Err(Error::config(format!("{name} must be finite and non-negative, got {value}")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Individual {
    pub genome: Vec<f64>,
    /// Empty until graded
    pub fitness: Vec<f64>,
    pub grade: f64,
}

impl Individual {
    fn new(genome: Vec<f64>) -> Self {
        Individual {
            genome,
            fitness: Vec::new(),
            grade: f64::INFINITY,
        }
    }
}

/// Summary of one generation, taken after grading and before selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub generation: usize,
    pub best_grade: f64,
    pub mean_grade: f64,
}

/// `Σ wᵢ·fᵢ`
pub fn weighted_sum(fitness: &[f64], weights: &[f64]) -> f64 {
    fitness
        .iter()
        .enumerate()
        .map(|(i, f)| f * weights.get(i).copied().unwrap_or(1.0))
        .sum()
}

/// Each gene comes from either parent with equal probability.
pub fn uniform_crossover(a: &[f64], b: &[f64], rng: &mut StdRng) -> Vec<f64> {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| if rng.random_bool(0.5) { x } else { y })
        .collect()
}

pub struct Population<'a> {
    individuals: Vec<Individual>,
    genome_len: usize,
    config: EvolutionConfig,
    fitness: FitnessFn<'a>,
    grade: GradeFn,
    mate: MateFn,
    rng: StdRng,
    generation: usize,
}

impl fmt::Debug for Population<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Population")
            .field("size", &self.individuals.len())
            .field("genome_len", &self.genome_len)
            .field("generation", &self.generation)
            .field("config", &self.config)
            .finish()
    }
}

impl<'a> Population<'a> {
    pub fn new(
        size: usize,
        genome_len: usize,
        config: EvolutionConfig,
        fitness: impl FnMut(&[f64]) -> Result<Vec<f64>> + 'a,
    ) -> Result<Self> {
        if size < 2 || genome_len == 0 {
            return Err(Error::config(format!(
                "population needs at least 2 individuals and a non-empty genome, got {size} x {genome_len}"
            )));
        }
        config.validate()?;

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let range = config.init_range;
        let genes = Uniform::new_inclusive(-range, range).map_err(|e| Error::config(e.to_string()))?;
        let individuals = (0..size)
            .map(|_| {
                let genome = (0..genome_len).map(|_| genes.sample(&mut rng)).collect();
                Individual::new(genome)
            })
            .collect();

        Ok(Population {
            individuals,
            genome_len,
            config,
            fitness: Box::new(fitness),
            grade: weighted_sum,
            mate: uniform_crossover,
            rng,
            generation: 0,
        })
    }

    pub fn with_grade(mut self, grade: GradeFn) -> Self {
        self.grade = grade;
        self
    }

    pub fn with_mate(mut self, mate: MateFn) -> Self {
        self.mate = mate;
        self
    }

    pub fn individuals(&self) -> &[Individual] {
        &self.individuals
    }

    pub fn generation(&self) -> usize {
        self.generation
    }

    /// Best graded individual, if any has been graded.
    pub fn best(&self) -> Option<&Individual> {
        self.individuals
            .iter()
            .filter(|individual| !individual.fitness.is_empty())
            .min_by(|a, b| a.grade.total_cmp(&b.grade))
    }

    /// Evaluates every individual and sorts the population best first.
    pub fn grade_all(&mut self) -> Result<()> {
        for individual in &mut self.individuals {
            individual.fitness = (self.fitness)(&individual.genome)?;
            let grade = (self.grade)(&individual.fitness, &self.config.fitness_weights);
            individual.grade = if grade.is_nan() { f64::INFINITY } else { grade };
        }
        self.individuals.sort_by(|a, b| a.grade.total_cmp(&b.grade));
        Ok(())
    }

    /// Grade, keep the best `survival_rate`, refill with mutated offspring.
    pub fn epoch(&mut self) -> Result<GenerationRecord> {
        self.grade_all()?;

        let size = self.individuals.len();
        let record = GenerationRecord {
            generation: self.generation,
            best_grade: self.individuals[0].grade,
            mean_grade: self.individuals.iter().map(|i| i.grade).sum::<f64>() / size as f64,
        };

        let survivors = ((size as f64 * self.config.survival_rate).round() as usize).clamp(1, size);
        self.individuals.truncate(survivors);

        let noise = Normal::new(0.0, self.config.mutation_delta).map_err(|e| Error::config(e.to_string()))?;
        while self.individuals.len() < size {
            let a = self.rng.random_range(0..survivors);
            let b = self.rng.random_range(0..survivors);
            let mut child = (self.mate)(
                &self.individuals[a].genome,
                &self.individuals[b].genome,
                &mut self.rng,
            );
            if child.len() != self.genome_len {
                return Err(Error::shape(format!(
                    "mate produced a genome of length {}, expected {}",
                    child.len(),
                    self.genome_len
                )));
            }
            for gene in &mut child {
                if self.rng.random_bool(self.config.mutation_rate) {
                    *gene += noise.sample(&mut self.rng);
                }
            }
            self.individuals.push(Individual::new(child));
        }

        debug!(generation = self.generation, survivors, "population refilled");
        info!(
            generation = record.generation,
            best = record.best_grade,
            mean = record.mean_grade,
            "generation complete"
        );
        self.generation += 1;
        Ok(record)
    }

    /// Runs `epochs` generations and grades the final population.
    pub fn run(&mut self, epochs: usize) -> Result<Vec<GenerationRecord>> {
        let records = (0..epochs).map(|_| self.epoch()).collect::<Result<Vec<_>>>()?;
        self.grade_all()?;
        Ok(records)
    }
}

/// Fitness of a genome used as the network's flattened weights: the mean
/// inference cost on `(input, target)`.
pub fn network_fitness<'a>(
    network: &'a mut Network,
    input: &'a Tensor,
    target: &'a Tensor,
) -> impl FnMut(&[f64]) -> Result<Vec<f64>> + 'a {
    move |genome| {
        network.set_weights_folded(genome)?;
        let evaluation = network.evaluate(input, target, false)?;
        Ok(vec![evaluation.cost])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sphere(genome: &[f64]) -> Result<Vec<f64>> {
        Ok(vec![genome.iter().map(|g| (g - 0.5).powi(2)).sum()])
    }

    fn config() -> EvolutionConfig {
        EvolutionConfig {
            seed: Some(17),
            ..Default::default()
        }
    }

    #[test]
    fn weighted_sum_defaults_missing_weights_to_one() {
        assert_eq!(weighted_sum(&[1.0, 2.0, 3.0], &[2.0]), 7.0);
    }

    #[test]
    fn crossover_takes_genes_from_parents() {
        let mut rng = StdRng::seed_from_u64(0);
        let child = uniform_crossover(&[0.0; 16], &[1.0; 16], &mut rng);
        assert_eq!(child.len(), 16);
        assert!(child.iter().all(|&g| g == 0.0 || g == 1.0));
    }

    #[test]
    fn population_size_is_fixed() {
        let mut population = Population::new(10, 4, config(), sphere).unwrap();
        population.run(3).unwrap();
        assert_eq!(population.individuals().len(), 10);
        assert_eq!(population.generation(), 3);
    }

    #[test]
    fn best_grade_never_worsens_with_elitism() {
        let mut population = Population::new(20, 3, config(), sphere).unwrap();
        let records = population.run(25).unwrap();
        for pair in records.windows(2) {
            assert!(pair[1].best_grade <= pair[0].best_grade);
        }
        let best = population.best().unwrap();
        assert!(best.grade <= records[0].best_grade);
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let bad = EvolutionConfig {
            survival_rate: 0.0,
            ..config()
        };
        assert!(matches!(Population::new(4, 2, bad, sphere), Err(Error::Configuration(_))));
        assert!(matches!(Population::new(1, 2, config(), sphere), Err(Error::Configuration(_))));
    }

    #[test]
    fn non_finite_ranges_are_rejected() {
        for (init_range, mutation_delta) in [(f64::INFINITY, 0.1), (1.0, f64::INFINITY), (f64::NAN, 0.1)] {
            let bad = EvolutionConfig {
                init_range,
                mutation_delta,
                ..config()
            };
            assert!(matches!(Population::new(4, 2, bad, sphere), Err(Error::Configuration(_))));
        }
        let huge = EvolutionConfig {
            init_range: f64::MAX,
            ..config()
        };
        assert!(matches!(Population::new(4, 2, huge, sphere), Err(Error::Configuration(_))));
    }
}
