use crate::hospital::HospitalPolicy;

/// Configuración del scheduler. Sólo el paquete raíz la lee del entorno.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Intervalos de flows ejecutándose a la vez (tamaño del pool).
    pub max_workers: usize,
    /// Capacidad del canal de señales de cada flow.
    pub signal_buffer: usize,
    /// Resultados de flows terminados que se conservan para `status` y
    /// `await_outcome`; los más antiguos se descartan.
    pub finished_capacity: usize,
    pub hospital: HospitalPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_workers: 8,
               signal_buffer: 64,
               finished_capacity: 1024,
               hospital: HospitalPolicy::default() }
    }
}

impl SchedulerConfig {
    pub fn with_max_workers(mut self, n: usize) -> Self {
        self.max_workers = n.max(1);
        self
    }

    pub fn with_finished_capacity(mut self, n: usize) -> Self {
        self.finished_capacity = n.max(1);
        self
    }

    pub fn with_hospital(mut self, policy: HospitalPolicy) -> Self {
        self.hospital = policy;
        self
    }
}
