#[derive(Debug, Error)]
enum ThresholdsConfigError {
    #[error("the initial thresholds amount must be greater than 0")]
    ZeroInitialAmount,

    #[error("no adjustment policy provided, at least one is required")]
    NoPolicies,

    #[error("policy percentages must be in the range [0, 1], policy {index} has {percentage}")]
    PercentageOutOfRange { index: usize, percentage: f32 },

    #[error("at least one policy must have a percentage of 0")]
    MissingZeroPercentage,

    #[error("error compiling adjustment policy with percentage {percentage:.2}: {source}")]
    BadExpression {
        percentage: f32,
        source: evalexpr::EvalexprError,
    },
}

type ComputeIncrement = Box<dyn Fn(u32, u32, u16) -> i32 + Send>;

// Percentages are expected sorted in descending order so the match below is
// a fall-through chain whose zero-percentage entry always terminates it.
struct AdjustmentPolicy {
    percentage: f32,
    compute_increment: ComputeIncrement,
}

// Decides how many probe ids the manager issues per batch. Owned by the
// manager task alone, so no locking anywhere.
struct ThresholdsController {
    count: u16,
    ref_timestamp: u32,
    policies: Vec<AdjustmentPolicy>,
}

impl ThresholdsController {
    fn new(
        initial_amount: u16,
        policies: Vec<AdjustmentPolicy>,
    ) -> Result<ThresholdsController, ThresholdsConfigError> {
        if initial_amount == 0 {
            return Err(ThresholdsConfigError::ZeroInitialAmount);
        }
        if policies.is_empty() {
            return Err(ThresholdsConfigError::NoPolicies);
        }
        let mut found_zero = false;
        for (index, policy) in policies.iter().enumerate() {
            if !(0.0..=1.0).contains(&policy.percentage) {
                return Err(ThresholdsConfigError::PercentageOutOfRange {
                    index,
                    percentage: policy.percentage,
                });
            }
            if policy.percentage == 0.0 {
                found_zero = true;
            }
        }
        if !found_zero {
            return Err(ThresholdsConfigError::MissingZeroPercentage);
        }

        Ok(ThresholdsController {
            count: initial_amount,
            // sentinel: no reference timestamp until the first update
            ref_timestamp: u32::MAX,
            policies,
        })
    }

    // Always greater than 0.
    fn count(&self) -> u16 {
        self.count
    }

    fn ref_timestamp(&self) -> u32 {
        self.ref_timestamp
    }

    fn update(&mut self, hit_level: u16, new_timestamp: u32) {
        for policy in &self.policies {
            let min_matching_level =
                (f64::from(policy.percentage) * f64::from(self.count)).ceil() as u16;
            if hit_level >= min_matching_level {
                let increment =
                    (policy.compute_increment)(self.ref_timestamp, new_timestamp, self.count);

                self.count = if increment < 0 {
                    let decrement = increment.unsigned_abs().min(u32::from(u16::MAX)) as u16;
                    self.count.saturating_sub(decrement).max(1)
                } else {
                    let increment = increment.min(i32::from(u16::MAX)) as u16;
                    self.count.saturating_add(increment)
                };

                break;
            }
        }

        self.ref_timestamp = new_timestamp;
    }
}

// The expression environment mirrors the config contract: CurrentTimestamp,
// NewTimestamp and ThresholdsAmount, with int results taken as-is and float
// results truncated.
fn compile_policies(configs: &[PolicyCfg]) -> Result<Vec<AdjustmentPolicy>, ThresholdsConfigError> {
    let mut policies = Vec::with_capacity(configs.len());

    for config in configs {
        let tree = build_operator_tree(&config.compute_increment).map_err(|source| {
            ThresholdsConfigError::BadExpression {
                percentage: config.percentage,
                source,
            }
        })?;
        let expression = config.compute_increment.clone();

        let compute: ComputeIncrement =
            Box::new(move |current_timestamp: u32, new_timestamp: u32, amount: u16| {
                let mut context = HashMapContext::new();
                let _ = context.set_value(
                    "CurrentTimestamp".to_string(),
                    ExprValue::Int(i64::from(current_timestamp)),
                );
                let _ = context.set_value(
                    "NewTimestamp".to_string(),
                    ExprValue::Int(i64::from(new_timestamp)),
                );
                let _ = context.set_value(
                    "ThresholdsAmount".to_string(),
                    ExprValue::Int(i64::from(amount)),
                );

                match tree.eval_with_context(&context) {
                    Ok(ExprValue::Int(value)) => value as i32,
                    Ok(ExprValue::Float(value)) => value as i32,
                    Ok(other) => fatal(&format!(
                        "adjustment expression {expression:?} returned a non-numeric value: {other:?}"
                    )),
                    Err(err) => fatal(&format!(
                        "error running successfully compiled adjustment expression {expression:?}: {err}"
                    )),
                }
            });

        policies.push(AdjustmentPolicy {
            percentage: config.percentage,
            compute_increment: compute,
        });
    }

    Ok(policies)
}
