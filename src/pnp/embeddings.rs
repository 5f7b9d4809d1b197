//! Text conditioning with the frozen CLIP text encoder.
use diffusers::transformers::clip;
use tch::{nn::Module, Device, Tensor};

pub struct TextEmbedder {
    tokenizer: clip::Tokenizer,
    text_model: clip::ClipTextTransformer,
    device: Device,
}

impl TextEmbedder {
    pub fn new(tokenizer: clip::Tokenizer, text_model: clip::ClipTextTransformer, device: Device) -> Self {
        Self { tokenizer, text_model, device }
    }

    /// Embeds a single prompt, padded or truncated to the encoder context, with a batch
    /// dimension of 1.
    pub fn encode(&self, prompt: &str) -> anyhow::Result<Tensor> {
        let tokens = self.tokenizer.encode(prompt)?;
        let tokens: Vec<i64> = tokens.into_iter().map(|x| x as i64).collect();
        let tokens = Tensor::from_slice(&tokens).view((1, -1)).to(self.device);
        Ok(tch::no_grad(|| self.text_model.forward(&tokens)))
    }

    /// The `[unconditional, conditional]` pair for a prompt, the unconditional half being
    /// the embedding of the negative prompt.
    pub fn embedding_pair(&self, prompt: &str, negative_prompt: &str) -> anyhow::Result<Tensor> {
        let text_embeddings = self.encode(prompt)?;
        let uncond_embeddings = self.encode(negative_prompt)?;
        Ok(Tensor::cat(&[uncond_embeddings, text_embeddings], 0))
    }

    /// The conditioning of the source slot of the denoising batch: the unconditional
    /// embedding of an empty prompt.
    pub fn guidance_embedding(&self) -> anyhow::Result<Tensor> {
        self.encode("")
    }
}
