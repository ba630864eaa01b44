//! Embedding gather kernel.

use candle_core::Tensor;

use crate::recorder::CommandRecorder;
use crate::Result;

/// `out[t] = table[ids[t]]`; `table` is `[vocab, hidden]`, returns `[t, hidden]`.
pub fn embedding_gather(rec: &mut CommandRecorder, table: &Tensor, ids: &[u32]) -> Result<Tensor> {
    rec.record()?;
    let idx = Tensor::new(ids, table.device())?;
    Ok(table.index_select(&idx, 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Runtime;
    use candle_core::Device;

    #[test]
    fn test_gather_rows() {
        let runtime = Runtime::cpu();
        let mut rec = runtime.recorder();

        let table = Tensor::from_vec(
            vec![0f32, 0.0, 1.0, 1.0, 2.0, 2.0],
            (3, 2),
            &Device::Cpu,
        )
        .unwrap();
        let out = embedding_gather(&mut rec, &table, &[2, 0, 2]).unwrap();
        assert_eq!(
            out.to_vec2::<f32>().unwrap(),
            vec![vec![2.0, 2.0], vec![0.0, 0.0], vec![2.0, 2.0]]
        );
    }
}
