//! Decoder parameter shapes derived from the model configuration

use runtime_core::config::ModelConfig;

use crate::param::ParameterSpec;

/// Build the ordered parameter set for a decoder-only model
///
/// Logical dimension names line up with the default rule table: `vocab`,
/// `mlp`, and `heads` shard over the model axis while `embed` replicates,
/// so no parameter maps one mesh axis to two of its dimensions.
pub fn model_parameter_specs(model: &ModelConfig) -> Vec<ParameterSpec> {
    let emb_dim = model.emb_dim();
    let mlp_dim = model.mlp_dim();
    let heads_dim = model.num_heads() * model.head_dim;

    let mut specs = Vec::new();
    specs.push(ParameterSpec::new(
        "token_embedding",
        vec![model.vocab_size, emb_dim],
        vec!["vocab", "embed"],
    ));

    for layer in 0..model.num_decoder_layers() {
        let prefix = format!("decoder.layers.{layer}");
        specs.push(ParameterSpec::new(
            format!("{prefix}.pre_attention_norm.scale"),
            vec![emb_dim],
            vec!["embed"],
        ));
        for projection in ["query", "key", "value"] {
            specs.push(ParameterSpec::new(
                format!("{prefix}.attention.{projection}"),
                vec![emb_dim, heads_dim],
                vec!["embed", "heads"],
            ));
        }
        specs.push(ParameterSpec::new(
            format!("{prefix}.attention.out"),
            vec![heads_dim, emb_dim],
            vec!["heads", "embed"],
        ));
        specs.push(ParameterSpec::new(
            format!("{prefix}.pre_mlp_norm.scale"),
            vec![emb_dim],
            vec!["embed"],
        ));
        specs.push(ParameterSpec::new(
            format!("{prefix}.mlp.wi"),
            vec![emb_dim, mlp_dim],
            vec!["embed", "mlp"],
        ));
        specs.push(ParameterSpec::new(
            format!("{prefix}.mlp.wo"),
            vec![mlp_dim, emb_dim],
            vec!["mlp", "embed"],
        ));
    }

    specs.push(ParameterSpec::new(
        "decoder.final_norm.scale",
        vec![emb_dim],
        vec!["embed"],
    ));
    specs.push(ParameterSpec::new(
        "output_head",
        vec![emb_dim, model.vocab_size],
        vec!["embed", "vocab"],
    ));

    specs
}
