// Shared fixtures for unit tests: a character tokenizer, a bigram model and
// a single-request HTTP server

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::thread::JoinHandle;

use candle_core::{DType, Device, Tensor};

use crate::dpo::LABEL_PAD_TOKEN_ID;
use crate::errors::EvalResult;
use crate::model::CausalLm;
use crate::tokenize::{TokenEncoder, TokenizedPair, TokenizedSequence};

/// Encodes each char as its code point, with optional multi-char merges.
///
/// Special tokens: BOS 1, EOS 2, PAD 0.
#[derive(Debug, Clone, Default)]
pub struct CharEncoder {
    merges: Vec<(String, u32)>,
}

impl CharEncoder {
    /// Encode every occurrence of `piece` as the single token `id`.
    pub fn with_merge(mut self, piece: &str, id: u32) -> Self {
        self.merges.push((piece.to_string(), id));
        self
    }
}

impl TokenEncoder for CharEncoder {
    fn encode(&self, text: &str) -> EvalResult<Vec<u32>> {
        let mut ids = Vec::new();
        let mut rest = text;
        while let Some(c) = rest.chars().next() {
            match self.merges.iter().find(|(piece, _)| rest.starts_with(piece.as_str())) {
                Some((piece, id)) => {
                    ids.push(*id);
                    rest = &rest[piece.len()..];
                }
                None => {
                    ids.push(c as u32);
                    rest = &rest[c.len_utf8()..];
                }
            }
        }
        Ok(ids)
    }

    fn bos_token_id(&self) -> Option<u32> {
        Some(1)
    }

    fn eos_token_id(&self) -> u32 {
        2
    }

    fn pad_token_id(&self) -> u32 {
        0
    }
}

/// Next-token logits depend only on the current token: row `i` of `table`.
pub struct BigramLm {
    table: Tensor,
}

impl BigramLm {
    fn from_rows(rows: Vec<f32>, vocab: usize, device: &Device) -> candle_core::Result<Self> {
        Ok(Self {
            table: Tensor::from_vec(rows, (vocab, vocab), device)?,
        })
    }

    /// Deterministic pseudo-random table; equal seeds give equal models.
    pub fn seeded(vocab: usize, seed: usize, device: &Device) -> candle_core::Result<Self> {
        let rows = (0..vocab * vocab)
            .map(|k| {
                let (i, j) = (k / vocab, k % vocab);
                ((i * 31 + j * 17 + seed * 13) % 11) as f32 / 3.0
            })
            .collect();
        Self::from_rows(rows, vocab, device)
    }

    /// Strongly predicts `token` after every position.
    pub fn favoring(vocab: usize, token: usize, device: &Device) -> candle_core::Result<Self> {
        let rows = (0..vocab * vocab)
            .map(|k| if k % vocab == token { 5.0 } else { 0.0 })
            .collect();
        Self::from_rows(rows, vocab, device)
    }

    pub fn uniform(vocab: usize, device: &Device) -> candle_core::Result<Self> {
        Ok(Self {
            table: Tensor::zeros((vocab, vocab), DType::F32, device)?,
        })
    }
}

impl CausalLm for BigramLm {
    fn forward_logits(
        &mut self,
        input_ids: &Tensor,
        _attention_mask: &Tensor,
    ) -> candle_core::Result<Tensor> {
        let (batch, seq_len) = input_ids.dims2()?;
        let vocab = self.table.dim(1)?;
        self.table
            .index_select(&input_ids.flatten_all()?, 0)?
            .reshape((batch, seq_len, vocab))
    }
}

fn sequence(prompt: &[u32], answer: &[u32]) -> TokenizedSequence {
    let input_ids: Vec<u32> = prompt.iter().chain(answer).copied().collect();
    let labels = input_ids
        .iter()
        .enumerate()
        .map(|(i, &id)| {
            if i < prompt.len() {
                LABEL_PAD_TOKEN_ID
            } else {
                id as i64
            }
        })
        .collect();
    TokenizedSequence {
        attention_mask: vec![1; input_ids.len()],
        input_ids,
        labels,
    }
}

/// A tokenized pair with the prompt span masked out of the labels.
pub fn pair_from_ids(prompt: &[u32], chosen: &[u32], rejected: &[u32]) -> TokenizedPair {
    TokenizedPair {
        chosen: sequence(prompt, chosen),
        rejected: sequence(prompt, rejected),
    }
}

/// What the local server received.
#[derive(Debug)]
pub struct RecordedRequest {
    pub request_line: String,
    pub headers: String,
    pub body: Vec<u8>,
}

/// Answer exactly one HTTP request on a loopback port with `status` and `body`.
///
/// Returns the server's base URL and a handle yielding the request it saw.
pub fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<RecordedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint = format!("http://{}", listener.local_addr().unwrap());

    let handle = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());

        let mut request_line = String::new();
        reader.read_line(&mut request_line).unwrap();

        let mut headers = String::new();
        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).unwrap() == 0 || line == "\r\n" {
                break;
            }
            if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                content_length = value.trim().parse().unwrap();
            }
            headers.push_str(&line);
        }

        let mut request_body = vec![0u8; content_length];
        reader.read_exact(&mut request_body).unwrap();

        write!(
            stream,
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
        .unwrap();
        stream.flush().unwrap();

        RecordedRequest {
            request_line: request_line.trim_end().to_string(),
            headers,
            body: request_body,
        }
    });

    (endpoint, handle)
}
