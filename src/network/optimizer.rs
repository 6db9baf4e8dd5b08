use ndarray::{Array2, Zip};

// Applies a gradient step to a network's parameters. Parameters are always visited in the same
// order, which is what lets Adam keep per-parameter moment estimates by position.
#[derive(Debug, Clone)]
pub enum Optimizer {
    GradientDescent { learning_rate: f64 },
    Adam(Adam),
}

impl Optimizer {
    pub fn gradient_descent(learning_rate: f64) -> Optimizer {
        Optimizer::GradientDescent { learning_rate }
    }

    pub fn adam(learning_rate: f64) -> Optimizer {
        Optimizer::Adam(Adam::new(learning_rate))
    }

    pub fn step(&mut self, parameters: Vec<(&mut Array2<f64>, &Array2<f64>)>) {
        match self {
            Optimizer::GradientDescent { learning_rate } => {
                for (parameter, grad) in parameters {
                    parameter.scaled_add(-*learning_rate, grad);
                }
            }
            Optimizer::Adam(adam) => adam.step(parameters),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    t: i32,
    m: Vec<Array2<f64>>,
    v: Vec<Array2<f64>>,
}

impl Adam {
    pub fn new(learning_rate: f64) -> Adam {
        Adam {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    pub fn steps_taken(&self) -> i32 {
        self.t
    }

    fn step(&mut self, parameters: Vec<(&mut Array2<f64>, &Array2<f64>)>) {
        if self.m.len() != parameters.len() {
            self.m = parameters.iter().map(|(p, _)| Array2::zeros(p.raw_dim())).collect();
            self.v = parameters.iter().map(|(p, _)| Array2::zeros(p.raw_dim())).collect();
        }
        self.t += 1;

        // Bias correction folded into the step size.
        let lr_t = self.learning_rate * (1.0 - self.beta2.powi(self.t)).sqrt()
            / (1.0 - self.beta1.powi(self.t));
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);

        for ((parameter, grad), (m, v)) in parameters
            .into_iter()
            .zip(self.m.iter_mut().zip(self.v.iter_mut()))
        {
            Zip::from(parameter)
                .and(grad)
                .and(m)
                .and(v)
                .for_each(|p, &g, m, v| {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    *p -= lr_t * *m / (v.sqrt() + epsilon);
                });
        }
    }
}
