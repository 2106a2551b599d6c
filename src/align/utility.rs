/// Disjoint-set union used for peak grouping over link graphs.
#[derive(Clone, Debug)]
pub struct Dsu {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl Dsu {
    #[inline]
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            size: vec![1; n],
        }
    }

    #[inline]
    pub fn find(&mut self, mut x: usize) -> usize {
        // path compression
        let mut root = self.parent[x];
        while root != self.parent[root] {
            root = self.parent[root];
        }
        while x != self.parent[x] {
            let next = self.parent[x];
            self.parent[x] = root;
            x = next;
        }
        root
    }

    #[inline]
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let mut ra = self.find(a);
        let mut rb = self.find(b);
        if ra == rb {
            return false;
        }
        // union by size
        if self.size[ra] < self.size[rb] {
            std::mem::swap(&mut ra, &mut rb);
        }
        self.parent[rb] = ra;
        self.size[ra] += self.size[rb];
        true
    }

    /// Component id per element, ids assigned 0.. in order of first
    /// encounter while scanning elements in index order. This keeps group
    /// numbering stable and reproducible for a fixed input order.
    pub fn component_ids(&mut self) -> Vec<usize> {
        let n = self.parent.len();
        let mut root_to_id: Vec<Option<usize>> = vec![None; n];
        let mut ids = Vec::with_capacity(n);
        let mut next = 0usize;
        for i in 0..n {
            let root = self.find(i);
            let id = match root_to_id[root] {
                Some(id) => id,
                None => {
                    root_to_id[root] = Some(next);
                    next += 1;
                    next - 1
                }
            };
            ids.push(id);
        }
        ids
    }
}

/// Pearson correlation coefficient of two equal-length vectors.
///
/// Degenerate inputs (length mismatch, fewer than two points, zero variance
/// on either side) yield 0.0 rather than NaN, so callers can treat the
/// result as "not correlated" without special cases.
pub fn pearson_correlation(x: &[f64], y: &[f64]) -> f64 {
    if x.len() != y.len() || x.len() < 2 {
        return 0.0;
    }
    let n = x.len() as f64;
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (&a, &b) in x.iter().zip(y.iter()) {
        let da = a - mean_x;
        let db = b - mean_y;
        cov += da * db;
        var_x += da * da;
        var_y += db * db;
    }
    if var_x <= 0.0 || var_y <= 0.0 {
        return 0.0;
    }
    cov / (var_x.sqrt() * var_y.sqrt())
}

/// Strict tolerance check: a delta exactly at the tolerance does not match.
#[inline]
pub fn within_tolerance(a: f64, b: f64, tolerance: f64) -> bool {
    (a - b).abs() < tolerance
}

/// Normalized Euclidean distance in (mass, time) space used to rank
/// correspondence candidates that already passed both strict gates.
#[inline]
pub fn alignment_distance(d_mz: f64, d_rt: f64, mz_tol: f64, rt_tol: f64) -> f64 {
    let a = d_mz / mz_tol;
    let b = d_rt / rt_tol;
    (a * a + b * b).sqrt()
}
